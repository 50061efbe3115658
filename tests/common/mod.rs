// Shared fixtures for workflow tests
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vmshift::config::{ClusterConfig, MemoryConfigStore};
use vmshift::credentials::Credentials;
use vmshift::testing::{ScriptedCredentials, ScriptedExecutor, StaticProber};
use vmshift::{MigrationOrchestrator, MigratorSettings};

pub const LOCAL_IP: &str = "10.0.0.2";

/// A scratch cluster: temp directories for the NFS mount, local VM storage
/// and definitions, plus scripted executor and prober.
pub struct Cluster {
    pub dir: TempDir,
    pub executor: Arc<ScriptedExecutor>,
    pub prober: Arc<StaticProber>,
    pub store: Arc<MemoryConfigStore>,
}

impl Cluster {
    pub fn new(reachable: &[&str]) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = ClusterConfig {
            server_ip: Some(LOCAL_IP.to_string()),
            client_ips: Some(vec![LOCAL_IP.to_string()]),
            nfs_path: Some(dir.path().join("nfs")),
            local_vm_path: Some(dir.path().join("vms")),
            xml_folder: Some(dir.path().join("xml")),
            vm_names: None,
        };
        std::fs::create_dir_all(dir.path().join("nfs")).expect("Failed to create mount");

        Self {
            dir,
            executor: Arc::new(ScriptedExecutor::new()),
            prober: Arc::new(StaticProber::reachable(reachable.iter().copied())),
            store: Arc::new(MemoryConfigStore::new(config)),
        }
    }

    pub fn with_config(self, update: ClusterConfig) -> Self {
        use vmshift::ConfigStore;
        self.store.write(update).expect("Failed to update config");
        self
    }

    pub fn nfs(&self) -> PathBuf {
        self.dir.path().join("nfs")
    }

    pub fn vms(&self) -> PathBuf {
        self.dir.path().join("vms")
    }

    pub fn xml(&self) -> PathBuf {
        self.dir.path().join("xml")
    }

    /// Places an image on the shared mount and returns its path.
    pub fn add_image(&self, file_name: &str) -> PathBuf {
        let path = self.nfs().join(file_name);
        std::fs::write(&path, b"raw disk").expect("Failed to write image");
        path
    }

    /// Defaults, except no real waiting between polls and a fixed local address.
    pub fn settings() -> MigratorSettings {
        let mut settings = MigratorSettings::default();
        settings.shutdown.poll_interval_secs = 0;
        settings.local_address = Some(LOCAL_IP.to_string());
        settings
    }

    pub fn orchestrator(&self) -> MigrationOrchestrator {
        self.orchestrator_with(ScriptedCredentials::new([Credentials::new("ops", "secret")]))
    }

    pub fn orchestrator_with(&self, credentials: ScriptedCredentials) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            self.executor.clone(),
            self.prober.clone(),
            self.store.clone(),
            Self::settings(),
        )
        .with_credentials(Box::new(credentials))
    }
}
