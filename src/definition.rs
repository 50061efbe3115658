//! Fetching a VM definition from its source host and applying it locally
//! only when it differs from what libvirt already holds here.
//!
//! Ordering is what keeps this safe to re-run: the new document is fully on
//! local disk before anything local is touched, and `define` only follows a
//! successful `undefine`.

use crate::credentials::Credentials;
use crate::executor::{CommandOutput, Host, RemoteCommand, RemoteExecutor};
use crate::transport::{discard, partial_path};
use crate::virsh::Virsh;
use crate::{Result, ShiftError, log_info, log_warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What [`DefinitionSync::sync_definition`] did to the local hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionAction {
    /// No local VM existed; defined from the fetched document.
    Defined,
    /// A different local definition was undefined and replaced.
    Redefined,
    /// The local definition was byte-identical; nothing changed.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedDefinition {
    pub path: PathBuf,
    pub action: DefinitionAction,
}

pub struct DefinitionSync {
    executor: Arc<dyn RemoteExecutor>,
    virsh: Virsh,
    xml_folder: PathBuf,
    staging_dir: String,
}

impl DefinitionSync {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        virsh: Virsh,
        xml_folder: impl Into<PathBuf>,
        staging_dir: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            virsh,
            xml_folder: xml_folder.into(),
            staging_dir: staging_dir.into(),
        }
    }

    pub fn local_path(&self, vm_name: &str) -> PathBuf {
        self.xml_folder.join(format!("{}.xml", vm_name))
    }

    fn staging_path(&self, vm_name: &str) -> String {
        format!("{}/{}.xml", self.staging_dir.trim_end_matches('/'), vm_name)
    }

    pub async fn sync_definition(
        &self,
        vm_name: &str,
        source: &Host,
        credentials: &Credentials,
    ) -> Result<SyncedDefinition> {
        log_info!("Fetching definition of '{}' from {}", vm_name, source);

        let path = self.fetch(vm_name, source, credentials).await?;
        let fetched = tokio::fs::read(&path)
            .await
            .map_err(|e| sync_error(vm_name, format!("cannot read {}: {}", path.display(), e)))?;

        let local = Credentials::local();
        let action = if self.is_defined_locally(vm_name, &local).await? {
            let current = self
                .run_local(vm_name, &local, &self.virsh.dumpxml(vm_name), "dump local definition")
                .await?;

            if current.stdout == fetched {
                log_info!("No changes in definition of '{}', skipping redefine", vm_name);
                DefinitionAction::Unchanged
            } else {
                log_info!("Definition of '{}' changed, redefining", vm_name);
                self.run_local(vm_name, &local, &self.virsh.undefine(vm_name), "undefine")
                    .await?;
                self.define(vm_name, &local, &path).await?;
                DefinitionAction::Redefined
            }
        } else {
            self.define(vm_name, &local, &path).await?;
            DefinitionAction::Defined
        };

        Ok(SyncedDefinition { path, action })
    }

    /// Exports on the source, then copies next to the final name and renames,
    /// so the local file is either the previous one or a complete new one.
    async fn fetch(&self, vm_name: &str, source: &Host, credentials: &Credentials) -> Result<PathBuf> {
        let staging = self.staging_path(vm_name);
        let export = self.virsh.dumpxml_to(vm_name, &staging);

        let output = self
            .executor
            .run(source, credentials, &export, None)
            .await
            .map_err(|e| sync_error(vm_name, format!("export on {} failed: {}", source, e)))?;
        if !output.success() {
            return Err(sync_error(
                vm_name,
                format!("export on {} failed: {}", source, output.diagnostics()),
            ));
        }

        tokio::fs::create_dir_all(&self.xml_folder).await.map_err(|e| {
            sync_error(vm_name, format!("cannot create {}: {}", self.xml_folder.display(), e))
        })?;

        let path = self.local_path(vm_name);
        let partial = partial_path(&path);
        let copied = self
            .executor
            .copy_from(source, credentials, &staging, &partial)
            .await;

        match copied {
            Ok(output) if output.success() => {}
            Ok(output) => {
                discard(&partial).await;
                return Err(sync_error(
                    vm_name,
                    format!("transfer from {} failed: {}", source, output.diagnostics()),
                ));
            }
            Err(e) => {
                discard(&partial).await;
                return Err(sync_error(vm_name, format!("transfer from {} failed: {}", source, e)));
            }
        }

        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| sync_error(vm_name, format!("cannot store {}: {}", path.display(), e)))?;

        let cleanup = RemoteCommand::from_args("rm", ["-f", staging.as_str()]);
        match self.executor.run(source, credentials, &cleanup, None).await {
            Ok(output) if output.success() => {}
            _ => log_warn!("Could not remove staged definition {} on {}", staging, source),
        }

        log_info!("Definition of '{}' copied to {}", vm_name, path.display());
        Ok(path)
    }

    async fn is_defined_locally(&self, vm_name: &str, local: &Credentials) -> Result<bool> {
        let output = self
            .executor
            .run(&Host::Local, local, &self.virsh.dominfo(vm_name), None)
            .await
            .map_err(|e| sync_error(vm_name, format!("dominfo failed: {}", e)))?;
        Ok(output.success())
    }

    async fn define(&self, vm_name: &str, local: &Credentials, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_local(vm_name, local, &self.virsh.define(&path), "define")
            .await?;
        log_info!("Defined '{}' locally", vm_name);
        Ok(())
    }

    async fn run_local(
        &self,
        vm_name: &str,
        local: &Credentials,
        command: &RemoteCommand,
        step: &str,
    ) -> Result<CommandOutput> {
        let output = self
            .executor
            .run(&Host::Local, local, command, None)
            .await
            .map_err(|e| sync_error(vm_name, format!("{} failed: {}", step, e)))?;
        if !output.success() {
            return Err(sync_error(
                vm_name,
                format!("{} failed: {}", step, output.diagnostics()),
            ));
        }
        Ok(output)
    }
}

fn sync_error(vm_name: &str, reason: String) -> ShiftError {
    ShiftError::DefinitionSync {
        vm: vm_name.to_string(),
        reason,
    }
}
