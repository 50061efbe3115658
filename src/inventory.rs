//! VMs living on the shared mount: creation from install media and
//! deletion, keeping the cluster record's `vm_names` in step.

use crate::config::{ConfigField, ConfigStore};
use crate::credentials::Credentials;
use crate::executor::{Host, RemoteCommand, RemoteExecutor};
use crate::virsh::Virsh;
use crate::{Result, ShiftError, log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    /// Local file, or a URL downloaded into the catalogue on first use.
    pub install_media: String,
    /// libosinfo short id, also the catalogue key.
    pub os_variant: String,
    pub disk_gb: u32,
    pub ram_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Relative to the shared mount.
    pub image_path: String,
    pub image_url: String,
}

/// Install media already downloaded to `<mount>/images`, indexed by OS
/// variant in `<mount>/images/config.json`.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    mount: PathBuf,
    entries: BTreeMap<String, CatalogEntry>,
}

impl ImageCatalog {
    pub fn images_dir(mount: &Path) -> PathBuf {
        mount.join("images")
    }

    pub fn index_path(mount: &Path) -> PathBuf {
        Self::images_dir(mount).join("config.json")
    }

    pub fn load(mount: &Path) -> Result<Self> {
        let index = Self::index_path(mount);
        let entries = if index.is_file() {
            serde_json::from_str(&fs::read_to_string(&index)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            mount: mount.to_path_buf(),
            entries,
        })
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(Self::images_dir(&self.mount))?;
        fs::write(
            Self::index_path(&self.mount),
            serde_json::to_string_pretty(&self.entries)?,
        )?;
        Ok(())
    }

    /// Absolute path of the media recorded for `os_variant`.
    pub fn get(&self, os_variant: &str) -> Option<PathBuf> {
        self.entries
            .get(os_variant)
            .map(|entry| self.mount.join(entry.image_path.trim_start_matches('/')))
    }

    pub fn insert(&mut self, os_variant: &str, entry: CatalogEntry) {
        self.entries.insert(os_variant.to_string(), entry);
    }
}

pub struct VmInventory {
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<dyn ConfigStore>,
    virsh: Virsh,
}

impl VmInventory {
    pub fn new(executor: Arc<dyn RemoteExecutor>, store: Arc<dyn ConfigStore>, virsh: Virsh) -> Self {
        Self {
            executor,
            store,
            virsh,
        }
    }

    fn mount(&self) -> Result<PathBuf> {
        self.store
            .read()?
            .field(ConfigField::NfsPath)
            .map(PathBuf::from)
            .ok_or_else(|| ShiftError::ConfigurationMissing(ConfigField::NfsPath.key().to_string()))
    }

    async fn run_local(&self, command: RemoteCommand) -> Result<()> {
        self.executor
            .run_checked(&Host::Local, &Credentials::local(), &command, None)
            .await?;
        Ok(())
    }

    /// Creates a raw disk for `spec` on the shared mount and installs from
    /// its media. Returns the disk path.
    pub async fn create_vm(&self, spec: &VmSpec) -> Result<PathBuf> {
        if self.store.read()?.has_vm(&spec.name) {
            return Err(ShiftError::VmAlreadyExists(spec.name.clone()));
        }

        let mount = self.mount()?;
        let media = self.install_media(&mount, spec).await?;
        let disk = mount.join(format!("{}.img", spec.name));
        let disk_str = disk.to_string_lossy().into_owned();

        let size = format!("{}G", spec.disk_gb);
        log_info!("Creating {} disk {}", size, disk.display());
        self.run_local(RemoteCommand::from_args(
            "qemu-img",
            ["create", "-f", "raw", disk_str.as_str(), size.as_str()],
        ))
        .await?;

        let disk_arg = format!(
            "{},device=disk,bus=virtio,size={},format=raw",
            disk_str, spec.disk_gb
        );
        let ram = spec.ram_mb.to_string();
        let media = media.to_string_lossy().into_owned();
        let install = RemoteCommand::from_args(
            "virt-install",
            [
                "--connect",
                self.virsh.uri(),
                "--name",
                spec.name.as_str(),
                "--os-variant",
                spec.os_variant.as_str(),
                "--ram",
                ram.as_str(),
                "--disk",
                disk_arg.as_str(),
                "--graphics",
                "vnc,listen=0.0.0.0",
                "--noautoconsole",
                "--hvm",
                "--cdrom",
                media.as_str(),
                "--boot",
                "cdrom,hd",
            ],
        )
        .as_privileged();
        self.run_local(install).await?;

        self.store.add_vm_name(&spec.name)?;
        log_info!("VM '{}' created", spec.name);
        Ok(disk)
    }

    async fn install_media(&self, mount: &Path, spec: &VmSpec) -> Result<PathBuf> {
        let local = Path::new(&spec.install_media);
        if local.is_file() {
            return Ok(local.to_path_buf());
        }

        let mut catalog = ImageCatalog::load(mount)?;
        if let Some(path) = catalog.get(&spec.os_variant) {
            log_info!("Using cached media for {}: {}", spec.os_variant, path.display());
            return Ok(path);
        }

        let url = spec.install_media.as_str();
        let file_name = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ShiftError::ImageNotFound(url.to_string()))?;

        let images = ImageCatalog::images_dir(mount);
        fs::create_dir_all(&images)?;
        let target = images.join(file_name);
        let target_str = target.to_string_lossy().into_owned();

        log_info!("Downloading {} to {}", url, target.display());
        self.run_local(RemoteCommand::from_args("wget", [url, "-O", target_str.as_str()]))
            .await?;

        catalog.insert(
            &spec.os_variant,
            CatalogEntry {
                image_path: format!("images/{}", file_name),
                image_url: url.to_string(),
            },
        );
        catalog.save()?;
        Ok(target)
    }

    /// Destroys and undefines `name` with its storage when its image is on
    /// the mount, then forgets it. Returns whether anything was removed from
    /// the hypervisor.
    pub async fn delete_vm(&self, name: &str) -> Result<bool> {
        let mount = self.mount()?;
        let image = mount.join(format!("{}.img", name));
        let known = self.store.read()?.has_vm(name);

        let removed = if image.exists() {
            let destroy = self.virsh.destroy(name).as_privileged();
            if let Err(e) = self.run_local(destroy).await {
                log_warn!("Could not stop '{}' (it may not be running): {}", name, e);
            }
            self.run_local(self.virsh.undefine_with_storage(name).as_privileged())
                .await?;
            log_info!("Deleted VM image: {}", image.display());
            true
        } else if known {
            log_warn!("VM image {} does not exist, nothing to delete", image.display());
            false
        } else {
            return Err(ShiftError::VmNotFound(name.to_string()));
        };

        self.store.remove_vm_name(name)?;
        Ok(removed)
    }
}
