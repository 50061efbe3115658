pub mod activation;
pub mod config;
pub mod credentials;
pub mod definition;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod live;
pub mod lock;
pub mod logger;
pub mod orchestrator;
pub mod probe;
pub mod settings;
pub mod shutdown;
pub mod testing;
pub mod transport;
pub mod virsh;
pub mod vm_image;

pub use error::{ErrorKind, ShiftError};

pub type Result<T> = std::result::Result<T, ShiftError>;

// Convenience re-exports for driving a migration
pub use config::{ClusterConfig, ConfigStore, JsonConfigStore};
pub use executor::{Host, RemoteExecutor, SshExecutor};
pub use lock::LockOutcome;
pub use orchestrator::{MigrationOrchestrator, MigrationReport, MigrationRequest, MigrationState};
pub use settings::MigratorSettings;
pub use transport::Transport;
