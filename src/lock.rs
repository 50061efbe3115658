use crate::credentials::Credentials;
use crate::executor::{Host, RemoteCommand, RemoteExecutor};
use crate::{Result, ShiftError, log_debug, log_error, log_info};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// State of a disk image on one host. `Indeterminate` means the question
/// could not be answered and must never be read as `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Free,
    InUse,
    Indeterminate,
}

impl LockOutcome {
    pub fn is_free(self) -> bool {
        self == LockOutcome::Free
    }
}

impl fmt::Display for LockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockOutcome::Free => "free",
            LockOutcome::InUse => "in-use",
            LockOutcome::Indeterminate => "indeterminate",
        })
    }
}

/// `fuser` exits 1 when no process has the file open, and also when it
/// could not look at the file at all.
const FUSER_NO_USERS_EXIT: i32 = 1;

const FUSER_UNCHECKED_MARKERS: &[&str] = &["does not exist", "no such file", "cannot stat"];

fn path_was_checked(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    !FUSER_UNCHECKED_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Asks a host whether any process holds an image open.
#[derive(Clone)]
pub struct ImageLockInspector {
    executor: Arc<dyn RemoteExecutor>,
    timeout: Duration,
}

impl ImageLockInspector {
    pub fn new(executor: Arc<dyn RemoteExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    pub fn command(image_path: &str) -> RemoteCommand {
        RemoteCommand::from_args("fuser", [image_path]).as_privileged()
    }

    /// Only an explicit credential rejection is an error; every other
    /// failure to get an answer is `Indeterminate`.
    pub async fn is_in_use(
        &self,
        host: &Host,
        credentials: &Credentials,
        image_path: &str,
    ) -> Result<LockOutcome> {
        log_info!("Checking if image {} is in use on host {}", image_path, host);

        let command = Self::command(image_path);
        let result = self
            .executor
            .run(host, credentials, &command, Some(self.timeout))
            .await;

        match result {
            Ok(output) if output.success() => Ok(LockOutcome::InUse),
            Ok(output)
                if output.exit_code == Some(FUSER_NO_USERS_EXIT) && path_was_checked(&output.stderr) =>
            {
                Ok(LockOutcome::Free)
            }
            Ok(output) => {
                log_debug!(
                    "Lock check on {} exited {:?}: {}",
                    host,
                    output.exit_code,
                    output.diagnostics()
                );
                Ok(LockOutcome::Indeterminate)
            }
            Err(err @ ShiftError::AuthenticationRejected { .. }) => Err(err),
            Err(err) => {
                log_error!("Error checking {} on {}: {}", image_path, host, err);
                Ok(LockOutcome::Indeterminate)
            }
        }
    }
}
