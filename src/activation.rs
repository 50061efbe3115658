use crate::credentials::Credentials;
use crate::executor::{Host, RemoteExecutor};
use crate::virsh::Virsh;
use crate::{Result, ShiftError, log_info};
use std::sync::Arc;

/// Starts VMs on this host.
pub struct VmActivator {
    executor: Arc<dyn RemoteExecutor>,
    virsh: Virsh,
}

impl VmActivator {
    pub fn new(executor: Arc<dyn RemoteExecutor>, virsh: Virsh) -> Self {
        Self { executor, virsh }
    }

    /// Starting a VM that is already running fails like any other refusal.
    pub async fn start(&self, vm_name: &str) -> Result<()> {
        log_info!("Starting VM '{}'", vm_name);

        let output = self
            .executor
            .run(&Host::Local, &Credentials::local(), &self.virsh.start(vm_name), None)
            .await
            .map_err(|e| ShiftError::ActivationFailure {
                vm: vm_name.to_string(),
                output: e.to_string(),
            })?;

        if !output.success() {
            return Err(ShiftError::ActivationFailure {
                vm: vm_name.to_string(),
                output: output.diagnostics(),
            });
        }

        log_info!("VM '{}' started", vm_name);
        Ok(())
    }
}
