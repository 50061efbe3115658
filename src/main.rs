use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use vmshift::{
    ClusterConfig, ConfigStore, JsonConfigStore, MigrationOrchestrator, MigrationReport,
    MigrationRequest, MigratorSettings, SshExecutor, Transport,
    config::ConfigField,
    credentials::{PromptCredentialProvider, PromptFieldResolver},
    inventory::{VmInventory, VmSpec},
    logger,
    probe::PingProber,
    virsh::Virsh,
};

#[derive(Parser)]
#[command(name = "vmshift")]
#[command(about = "Cold and live VM migration between libvirt hosts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the cluster configuration record
    #[arg(short, long, default_value = JsonConfigStore::DEFAULT_PATH)]
    config: PathBuf,

    /// Path to migrator settings (TOML)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a VM whose image is on the shared NFS mount, stopping it at its source first
    MigrateNfs {
        /// Image file name under the NFS mount
        image: String,
        /// Host currently running the VM; every configured client is checked when omitted
        #[arg(long)]
        source: Option<String>,
    },
    /// Copy a VM image from a host over SCP and start it here
    MigrateScp {
        /// Host holding the image
        host: String,
        /// Image file name (searched on the host) or absolute path
        image: String,
    },
    /// Live-migrate a running VM from a host to this one
    MigrateLive {
        /// VM name
        vm: String,
        /// Host currently running the VM
        host: String,
        /// Disk is on the shared NFS mount; otherwise it is streamed along
        #[arg(long)]
        shared_storage: bool,
    },
    /// Create a VM on the shared NFS mount
    CreateVm {
        /// Name of the new VM
        name: String,
        /// Local install media path or download URL
        #[arg(long)]
        media: String,
        /// OS variant (see `osinfo-query os`)
        #[arg(long)]
        os_variant: String,
        /// Disk size in GB
        #[arg(long, default_value_t = 20)]
        disk_gb: u32,
        /// Memory in MB
        #[arg(long, default_value_t = 2048)]
        ram_mb: u32,
    },
    /// Delete a VM from the shared NFS mount with its storage
    DeleteVm {
        /// Name of the VM
        name: String,
    },
    /// Cluster configuration management
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the stored cluster configuration
    Show,
    /// Set one field (server_ip, client_ips, nfs_path, local_vm_path, xml_folder)
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "vmshift=debug");
        }
    }
    logger::init_logger();

    let settings = MigratorSettings::load(cli.settings.as_deref()).context("loading settings")?;
    let store: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::new(&cli.config));
    let executor = Arc::new(SshExecutor::new(settings.ssh.clone()));

    match cli.command {
        Commands::MigrateNfs { image, source } => {
            let request = MigrationRequest::cold_shared(image, source);
            let report = orchestrator(executor, store, settings).migrate(request).await?;
            print_report(&report);
        }
        Commands::MigrateScp { host, image } => {
            let request = MigrationRequest::cold_copy(host, image);
            let report = orchestrator(executor, store, settings).migrate(request).await?;
            print_report(&report);
        }
        Commands::MigrateLive {
            vm,
            host,
            shared_storage,
        } => {
            let transport = if shared_storage {
                Transport::SharedStorage
            } else {
                Transport::Copy
            };
            let request = MigrationRequest::live(vm, host, transport);
            let report = orchestrator(executor, store, settings).migrate(request).await?;
            print_report(&report);
        }
        Commands::CreateVm {
            name,
            media,
            os_variant,
            disk_gb,
            ram_mb,
        } => {
            let inventory = VmInventory::new(executor, store, Virsh::new(settings.libvirt.uri));
            let spec = VmSpec {
                name,
                install_media: media,
                os_variant,
                disk_gb,
                ram_mb,
            };
            let disk = inventory.create_vm(&spec).await?;
            println!("✅ VM '{}' created with disk {}", spec.name, disk.display());
        }
        Commands::DeleteVm { name } => {
            let inventory = VmInventory::new(executor, store, Virsh::new(settings.libvirt.uri));
            if inventory.delete_vm(&name).await? {
                println!("✅ VM '{}' deleted", name);
            } else {
                println!("VM '{}' had no image on the mount; removed from the configuration", name);
            }
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                let config = store.read()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigCommands::Set { key, value } => {
                let Some(field) = ConfigField::from_key(&key) else {
                    bail!("unknown configuration key '{}'", key);
                };
                store.write(ClusterConfig::with_field(field, &value))?;
                println!("✅ {} updated", key);
            }
        },
    }

    Ok(())
}

fn orchestrator(
    executor: Arc<SshExecutor>,
    store: Arc<dyn ConfigStore>,
    settings: MigratorSettings,
) -> MigrationOrchestrator {
    let prober = Arc::new(PingProber::new(settings.probe_timeout()));
    MigrationOrchestrator::new(executor, prober, store, settings)
        .with_credentials(Box::new(PromptCredentialProvider))
        .with_field_resolver(Box::new(PromptFieldResolver))
}

fn print_report(report: &MigrationReport) {
    let trace: Vec<String> = report.states.iter().map(ToString::to_string).collect();
    println!("✅ VM '{}' migrated ({})", report.vm_name, report.mode);
    if let Some(source) = &report.source {
        println!("   Source:   {}", source);
    }
    if let Some(path) = &report.image_path {
        println!("   Image:    {}", path.display());
    }
    if let Some(action) = report.definition {
        println!("   Definition: {:?}", action);
    }
    println!("   Stages:   {}", trace.join(" → "));
    println!(
        "   Duration: {}s",
        (report.finished_at - report.started_at).num_seconds()
    );
}
