use crate::orchestrator::MigrationState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("Host {0} is not reachable")]
    HostUnreachable(String),

    /// The remote side explicitly rejected the supplied credentials.
    /// Terminal for the current attempt; the session may collect new ones.
    #[error("Authentication rejected by {host}: {detail}")]
    AuthenticationRejected { host: String, detail: String },

    /// Could not ask: the host was never reached or the transport broke.
    #[error("Could not execute on {host}: {reason}")]
    ExecutionFailed { host: String, reason: String },

    #[error("Command on {host} timed out after {seconds}s: {command}")]
    CommandTimeout {
        host: String,
        command: String,
        seconds: u64,
    },

    /// Asked, and the answer was no.
    #[error("Command failed (exit {exit_code:?}): {command}\n{stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Image {image} still in use after {attempts} checks")]
    StillInUseTimeout { image: String, attempts: u32 },

    #[error("Failed to sync definition of '{vm}': {reason}")]
    DefinitionSync { vm: String, reason: String },

    #[error("Failed to copy {source_path}: {reason}")]
    CopyFailure { source_path: String, reason: String },

    #[error("Failed to start VM '{vm}':\n{output}")]
    ActivationFailure { vm: String, output: String },

    #[error("Live migration of '{vm}' failed:\n{stderr}")]
    LiveMigrationFailure { vm: String, stderr: String },

    #[error("Missing configuration field '{0}'")]
    ConfigurationMissing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("VM '{0}' already exists")]
    VmAlreadyExists(String),

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("Credentials unavailable for {host}: {reason}")]
    CredentialsUnavailable { host: String, reason: String },

    #[error("Migration failed while {stage}: {source}")]
    StageFailed {
        stage: MigrationState,
        #[source]
        source: Box<ShiftError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Serde(String),
}

/// Flat projection of [`ShiftError`], carried by the terminal `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HostUnreachable,
    AuthenticationRejected,
    ExecutionFailed,
    CommandTimeout,
    CommandFailed,
    ImageNotFound,
    StillInUseTimeout,
    DefinitionSync,
    CopyFailure,
    ActivationFailure,
    LiveMigrationFailure,
    ConfigurationMissing,
    InvalidConfig,
    VmAlreadyExists,
    VmNotFound,
    CredentialsUnavailable,
    Io,
    Serde,
}

impl ShiftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShiftError::HostUnreachable(_) => ErrorKind::HostUnreachable,
            ShiftError::AuthenticationRejected { .. } => ErrorKind::AuthenticationRejected,
            ShiftError::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            ShiftError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            ShiftError::CommandFailed { .. } => ErrorKind::CommandFailed,
            ShiftError::ImageNotFound(_) => ErrorKind::ImageNotFound,
            ShiftError::StillInUseTimeout { .. } => ErrorKind::StillInUseTimeout,
            ShiftError::DefinitionSync { .. } => ErrorKind::DefinitionSync,
            ShiftError::CopyFailure { .. } => ErrorKind::CopyFailure,
            ShiftError::ActivationFailure { .. } => ErrorKind::ActivationFailure,
            ShiftError::LiveMigrationFailure { .. } => ErrorKind::LiveMigrationFailure,
            ShiftError::ConfigurationMissing(_) => ErrorKind::ConfigurationMissing,
            ShiftError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ShiftError::VmAlreadyExists(_) => ErrorKind::VmAlreadyExists,
            ShiftError::VmNotFound(_) => ErrorKind::VmNotFound,
            ShiftError::CredentialsUnavailable { .. } => ErrorKind::CredentialsUnavailable,
            ShiftError::StageFailed { source, .. } => source.kind(),
            ShiftError::Io(_) => ErrorKind::Io,
            ShiftError::Serde(_) => ErrorKind::Serde,
        }
    }

    pub fn is_authentication(&self) -> bool {
        self.kind() == ErrorKind::AuthenticationRejected
    }

    /// Stage at which an orchestrated migration stopped, if this error came
    /// out of the orchestrator.
    pub fn failed_stage(&self) -> Option<MigrationState> {
        match self {
            ShiftError::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for ShiftError {
    fn from(err: toml::de::Error) -> Self {
        ShiftError::Serde(err.to_string())
    }
}

impl From<serde_json::Error> for ShiftError {
    fn from(err: serde_json::Error) -> Self {
        ShiftError::Serde(err.to_string())
    }
}
