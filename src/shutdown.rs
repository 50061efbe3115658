use crate::credentials::Credentials;
use crate::executor::{Host, RemoteExecutor};
use crate::lock::{ImageLockInspector, LockOutcome};
use crate::settings::ShutdownSettings;
use crate::virsh::Virsh;
use crate::vm_image::VmImage;
use crate::{Result, ShiftError, log_info, log_warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Poll budget for [`ShutdownCoordinator::ensure_quiesced`].
#[derive(Debug, Clone)]
pub struct QuiescePolicy {
    pub interval: Duration,
    pub attempts: u32,
    pub max_consecutive_indeterminate: Option<u32>,
    /// Ceiling on the shutdown request itself.
    pub request_timeout: Duration,
}

impl From<&ShutdownSettings> for QuiescePolicy {
    fn from(settings: &ShutdownSettings) -> Self {
        Self {
            interval: settings.poll_interval(),
            attempts: settings.poll_attempts,
            max_consecutive_indeterminate: settings.max_consecutive_indeterminate,
            request_timeout: settings.lock_check_timeout(),
        }
    }
}

impl Default for QuiescePolicy {
    fn default() -> Self {
        Self::from(&ShutdownSettings::default())
    }
}

/// Requests a graceful shutdown and waits until the image is released.
pub struct ShutdownCoordinator {
    executor: Arc<dyn RemoteExecutor>,
    inspector: ImageLockInspector,
    virsh: Virsh,
    policy: QuiescePolicy,
}

impl ShutdownCoordinator {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        inspector: ImageLockInspector,
        virsh: Virsh,
        policy: QuiescePolicy,
    ) -> Self {
        Self {
            executor,
            inspector,
            virsh,
            policy,
        }
    }

    /// Returns `Free` only after the inspector has reported it; never earlier.
    /// Each poll sleeps one interval first, as shutdown is asynchronous.
    pub async fn ensure_quiesced(
        &self,
        host: &Host,
        credentials: &Credentials,
        image_path: &str,
    ) -> Result<LockOutcome> {
        let vm_name = VmImage::from_path(image_path).name().to_string();
        log_info!("Attempting to shut down VM '{}' on host {}", vm_name, host);

        let request = self.virsh.shutdown(&vm_name).as_privileged();
        match self
            .executor
            .run(host, credentials, &request, Some(self.policy.request_timeout))
            .await
        {
            Ok(output) if output.success() => {}
            Ok(output) => log_warn!(
                "Shutdown request for '{}' on {} was refused: {}",
                vm_name,
                host,
                output.diagnostics()
            ),
            Err(err @ ShiftError::AuthenticationRejected { .. }) => return Err(err),
            Err(err) => log_warn!("Shutdown request for '{}' on {} failed: {}", vm_name, host, err),
        }

        log_info!("Waiting for VM '{}' to shut down", vm_name);
        let mut consecutive_indeterminate = 0;

        for attempt in 1..=self.policy.attempts {
            sleep(self.policy.interval).await;

            match self.inspector.is_in_use(host, credentials, image_path).await? {
                LockOutcome::Free => {
                    log_info!("Image {} is no longer in use on {}", image_path, host);
                    return Ok(LockOutcome::Free);
                }
                LockOutcome::InUse => {
                    consecutive_indeterminate = 0;
                    log_info!(
                        "Still in use ({}/{}), waiting",
                        attempt,
                        self.policy.attempts
                    );
                }
                LockOutcome::Indeterminate => {
                    consecutive_indeterminate += 1;
                    log_warn!(
                        "Could not confirm state of {} on {} ({}/{})",
                        image_path,
                        host,
                        attempt,
                        self.policy.attempts
                    );
                    if self
                        .policy
                        .max_consecutive_indeterminate
                        .is_some_and(|limit| consecutive_indeterminate >= limit)
                    {
                        return Err(ShiftError::HostUnreachable(host.to_string()));
                    }
                }
            }
        }

        Err(ShiftError::StillInUseTimeout {
            image: image_path.to_string(),
            attempts: self.policy.attempts,
        })
    }
}
