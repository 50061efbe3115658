use crate::credentials::Credentials;
use crate::executor::{Host, RemoteExecutor};
use crate::settings::LiveMigrationSettings;
use crate::virsh::{StorageMode, Virsh};
use crate::{Result, ShiftError, log_info};
use std::sync::Arc;

/// Drives `virsh migrate` on the source host, pulling the running VM to
/// this one. A single call, never retried.
pub struct LiveMigrationInvoker {
    executor: Arc<dyn RemoteExecutor>,
    virsh: Virsh,
    ports: LiveMigrationSettings,
}

impl LiveMigrationInvoker {
    pub fn new(executor: Arc<dyn RemoteExecutor>, virsh: Virsh, ports: LiveMigrationSettings) -> Self {
        Self {
            executor,
            virsh,
            ports,
        }
    }

    /// Transfer port for `mode`; shared and copied storage never share one.
    pub fn port_for(&self, mode: StorageMode) -> u16 {
        match mode {
            StorageMode::Shared => self.ports.shared_storage_port,
            StorageMode::Copy => self.ports.copy_storage_port,
        }
    }

    /// `source` runs the migration; `destination_user@destination_host` is
    /// where the VM lands. A failure leaves the source VM authoritative.
    #[allow(clippy::too_many_arguments)]
    pub async fn live_migrate(
        &self,
        vm_name: &str,
        source: &Host,
        credentials: &Credentials,
        destination_user: &str,
        destination_host: &str,
        mode: StorageMode,
        transfer_port: u16,
    ) -> Result<()> {
        let destination_uri = format!("qemu+ssh://{}@{}/system", destination_user, destination_host);
        let migrate_uri = format!("tcp://{}:{}", destination_host, transfer_port);
        let command = self
            .virsh
            .migrate(vm_name, &destination_uri, &migrate_uri, mode)
            .as_privileged();

        log_info!(
            "Migrating '{}' from {} to {} over port {}",
            vm_name,
            source,
            destination_host,
            transfer_port
        );

        let output = self
            .executor
            .run(source, credentials, &command, None)
            .await
            .map_err(|e| match e {
                err @ ShiftError::AuthenticationRejected { .. } => err,
                other => ShiftError::LiveMigrationFailure {
                    vm: vm_name.to_string(),
                    stderr: other.to_string(),
                },
            })?;

        if !output.success() {
            return Err(ShiftError::LiveMigrationFailure {
                vm: vm_name.to_string(),
                stderr: output.diagnostics(),
            });
        }

        log_info!("VM '{}' migrated successfully", vm_name);
        Ok(())
    }
}
