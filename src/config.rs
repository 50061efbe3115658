use crate::{Result, ShiftError, log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persisted cluster record. Absent keys stay absent on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_vm_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_names: Option<BTreeSet<String>>,
}

/// Keys of [`ClusterConfig`] that workflows may need resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    ServerIp,
    ClientIps,
    NfsPath,
    LocalVmPath,
    XmlFolder,
}

impl ConfigField {
    pub fn key(&self) -> &'static str {
        match self {
            ConfigField::ServerIp => "server_ip",
            ConfigField::ClientIps => "client_ips",
            ConfigField::NfsPath => "nfs_path",
            ConfigField::LocalVmPath => "local_vm_path",
            ConfigField::XmlFolder => "xml_folder",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "server_ip" => Some(ConfigField::ServerIp),
            "client_ips" => Some(ConfigField::ClientIps),
            "nfs_path" => Some(ConfigField::NfsPath),
            "local_vm_path" => Some(ConfigField::LocalVmPath),
            "xml_folder" => Some(ConfigField::XmlFolder),
            _ => None,
        }
    }
}

impl ClusterConfig {
    /// Fields set in `update` replace ours; unset fields are left alone.
    pub fn merge(&mut self, update: ClusterConfig) {
        if update.server_ip.is_some() {
            self.server_ip = update.server_ip;
        }
        if update.client_ips.is_some() {
            self.client_ips = update.client_ips;
        }
        if update.nfs_path.is_some() {
            self.nfs_path = update.nfs_path;
        }
        if update.local_vm_path.is_some() {
            self.local_vm_path = update.local_vm_path;
        }
        if update.xml_folder.is_some() {
            self.xml_folder = update.xml_folder;
        }
        if update.vm_names.is_some() {
            self.vm_names = update.vm_names;
        }
    }

    /// Raw string form of a field, as a prompt would have entered it.
    pub fn field(&self, field: ConfigField) -> Option<String> {
        let value = match field {
            ConfigField::ServerIp => self.server_ip.clone(),
            ConfigField::ClientIps => self.client_ips.as_ref().map(|ips| ips.join(",")),
            ConfigField::NfsPath => self.nfs_path.as_ref().map(|p| p.display().to_string()),
            ConfigField::LocalVmPath => self.local_vm_path.as_ref().map(|p| p.display().to_string()),
            ConfigField::XmlFolder => self.xml_folder.as_ref().map(|p| p.display().to_string()),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// Partial record with a single field set from its string form.
    pub fn with_field(field: ConfigField, value: &str) -> Self {
        let value = value.trim();
        let mut update = ClusterConfig::default();
        match field {
            ConfigField::ServerIp => update.server_ip = Some(value.to_string()),
            ConfigField::ClientIps => {
                update.client_ips = Some(
                    value
                        .split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|ip| !ip.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            ConfigField::NfsPath => update.nfs_path = Some(PathBuf::from(value)),
            ConfigField::LocalVmPath => update.local_vm_path = Some(PathBuf::from(value)),
            ConfigField::XmlFolder => update.xml_folder = Some(PathBuf::from(value)),
        }
        update
    }

    pub fn vm_names(&self) -> BTreeSet<String> {
        self.vm_names.clone().unwrap_or_default()
    }

    pub fn has_vm(&self, name: &str) -> bool {
        self.vm_names.as_ref().is_some_and(|names| names.contains(name))
    }
}

/// Read/merge access to the persisted cluster record.
pub trait ConfigStore: Send + Sync {
    fn read(&self) -> Result<ClusterConfig>;
    fn write(&self, update: ClusterConfig) -> Result<()>;

    fn add_vm_name(&self, name: &str) -> Result<()> {
        let mut names = self.read()?.vm_names();
        if names.insert(name.to_string()) {
            self.write(ClusterConfig {
                vm_names: Some(names),
                ..Default::default()
            })?;
        }
        Ok(())
    }

    fn remove_vm_name(&self, name: &str) -> Result<()> {
        let mut names = self.read()?.vm_names();
        if names.remove(name) {
            self.write(ClusterConfig {
                vm_names: Some(names),
                ..Default::default()
            })?;
        }
        Ok(())
    }
}

/// Cluster record kept as pretty-printed JSON on disk.
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub const DEFAULT_PATH: &str = "config.json";

    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn read(&self) -> Result<ClusterConfig> {
        if !self.path.exists() {
            return Ok(ClusterConfig::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents).map_err(|e| {
            ShiftError::Serde(format!("failed to read {}: {}", self.path.display(), e))
        })
    }

    fn write(&self, update: ClusterConfig) -> Result<()> {
        let mut current = if self.path.exists() {
            let contents = fs::read_to_string(&self.path)?;
            match serde_json::from_str::<ClusterConfig>(&contents) {
                Ok(config) => config,
                Err(_) => {
                    log_warn!("{} is not valid JSON, overwriting", self.path.display());
                    ClusterConfig::default()
                }
            }
        } else {
            ClusterConfig::default()
        };

        current.merge(update);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&current)?;
        fs::write(&self.path, contents)?;
        log_info!("Saved cluster configuration to {}", self.path.display());
        Ok(())
    }
}

/// Cluster record held in memory only.
#[derive(Default)]
pub struct MemoryConfigStore {
    inner: Mutex<ClusterConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            inner: Mutex::new(config),
        }
    }

    pub fn snapshot(&self) -> ClusterConfig {
        self.inner.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read(&self) -> Result<ClusterConfig> {
        self.inner
            .lock()
            .map(|c| c.clone())
            .map_err(|_| ShiftError::InvalidConfig("config store lock poisoned".to_string()))
    }

    fn write(&self, update: ClusterConfig) -> Result<()> {
        let mut current = self
            .inner
            .lock()
            .map_err(|_| ShiftError::InvalidConfig("config store lock poisoned".to_string()))?;
        current.merge(update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut config = ClusterConfig {
            server_ip: Some("10.0.0.1".to_string()),
            nfs_path: Some(PathBuf::from("/mnt/nfs")),
            ..Default::default()
        };

        config.merge(ClusterConfig {
            nfs_path: Some(PathBuf::from("/srv/nfs")),
            ..Default::default()
        });

        assert_eq!(config.server_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(config.nfs_path, Some(PathBuf::from("/srv/nfs")));
        assert!(config.xml_folder.is_none());
    }

    #[test]
    fn test_json_store_round_trips_and_omits_absent_keys() {
        let dir = TempDir::new().unwrap();
        let store = JsonConfigStore::new(dir.path().join("config.json"));

        assert_eq!(store.read().unwrap(), ClusterConfig::default());

        store
            .write(ClusterConfig::with_field(ConfigField::ClientIps, "10.0.0.5, 10.0.0.9"))
            .unwrap();
        store
            .write(ClusterConfig::with_field(ConfigField::XmlFolder, "/var/lib/vmshift/xml"))
            .unwrap();

        let config = store.read().unwrap();
        assert_eq!(
            config.client_ips,
            Some(vec!["10.0.0.5".to_string(), "10.0.0.9".to_string()])
        );
        assert_eq!(config.xml_folder, Some(PathBuf::from("/var/lib/vmshift/xml")));

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("server_ip"));
        assert!(!raw.contains("nfs_path"));
    }

    #[test]
    fn test_json_store_overwrites_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let store = JsonConfigStore::new(&path);

        assert!(store.read().is_err());
        store
            .write(ClusterConfig::with_field(ConfigField::NfsPath, "/mnt/nfs"))
            .unwrap();
        assert_eq!(store.read().unwrap().nfs_path, Some(PathBuf::from("/mnt/nfs")));
    }

    #[test]
    fn test_vm_names_are_unique() {
        let store = MemoryConfigStore::default();
        store.add_vm_name("web01").unwrap();
        store.add_vm_name("web01").unwrap();
        store.add_vm_name("db01").unwrap();
        assert_eq!(store.snapshot().vm_names().len(), 2);

        store.remove_vm_name("web01").unwrap();
        let config = store.snapshot();
        assert!(!config.has_vm("web01"));
        assert!(config.has_vm("db01"));
    }

    #[test]
    fn test_blank_field_counts_as_missing() {
        let config = ClusterConfig {
            server_ip: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(config.field(ConfigField::ServerIp), None);
        assert_eq!(ConfigField::from_key("xml_folder"), Some(ConfigField::XmlFolder));
        assert_eq!(ConfigField::from_key("vm_names"), None);
    }
}
