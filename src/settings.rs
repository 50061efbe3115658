use crate::{Result, ShiftError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for a migration run, loaded from a TOML file. Every field has a
/// default so an empty file (or no file) is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratorSettings {
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub live: LiveMigrationSettings,
    #[serde(default)]
    pub libvirt: LibvirtSettings,
    /// Address this host advertises to migration sources. Discovered when unset.
    #[serde(default)]
    pub local_address: Option<String>,
    /// How many times credentials are collected for one session.
    #[serde(default = "default_auth_retry_limit")]
    pub auth_retry_limit: u32,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_lock_check_timeout_secs")]
    pub lock_check_timeout_secs: u64,
    /// Give up early after this many `indeterminate` lock checks in a row.
    #[serde(default)]
    pub max_consecutive_indeterminate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMigrationSettings {
    #[serde(default = "default_shared_storage_port")]
    pub shared_storage_port: u16,
    #[serde(default = "default_copy_storage_port")]
    pub copy_storage_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibvirtSettings {
    #[serde(default = "default_libvirt_uri")]
    pub uri: String,
    /// Directory on the source host where definitions are staged before transfer.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
}

impl Default for MigratorSettings {
    fn default() -> Self {
        Self {
            shutdown: ShutdownSettings::default(),
            ssh: SshSettings::default(),
            live: LiveMigrationSettings::default(),
            libvirt: LibvirtSettings::default(),
            local_address: None,
            auth_retry_limit: default_auth_retry_limit(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_attempts: default_poll_attempts(),
            lock_check_timeout_secs: default_lock_check_timeout_secs(),
            max_consecutive_indeterminate: None,
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: None,
            identity_file: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for LiveMigrationSettings {
    fn default() -> Self {
        Self {
            shared_storage_port: default_shared_storage_port(),
            copy_storage_port: default_copy_storage_port(),
        }
    }
}

impl Default for LibvirtSettings {
    fn default() -> Self {
        Self {
            uri: default_libvirt_uri(),
            staging_dir: default_staging_dir(),
        }
    }
}

fn default_auth_retry_limit() -> u32 {
    3
}

fn default_probe_timeout_secs() -> u64 {
    1
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_attempts() -> u32 {
    12
}

fn default_lock_check_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_shared_storage_port() -> u16 {
    49152
}

fn default_copy_storage_port() -> u16 {
    49153
}

fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

fn default_staging_dir() -> String {
    "/tmp/vmshift".to_string()
}

impl ShutdownSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lock_check_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_check_timeout_secs)
    }
}

impl MigratorSettings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let settings: MigratorSettings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// `$XDG_CONFIG_HOME/vmshift/settings.toml` or equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vmshift").join("settings.toml"))
    }

    /// Loads `path` when given, otherwise the default location if it exists,
    /// otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shutdown.poll_attempts == 0 {
            return Err(ShiftError::InvalidConfig(
                "shutdown.poll_attempts must be at least 1".to_string(),
            ));
        }
        if self.auth_retry_limit == 0 {
            return Err(ShiftError::InvalidConfig(
                "auth_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.live.shared_storage_port == self.live.copy_storage_port {
            return Err(ShiftError::InvalidConfig(
                "live migration ports for shared and copied storage must differ".to_string(),
            ));
        }
        if self.shutdown.max_consecutive_indeterminate == Some(0) {
            return Err(ShiftError::InvalidConfig(
                "shutdown.max_consecutive_indeterminate must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
