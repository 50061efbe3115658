//! Composes the components into the cold and live migration workflows.
//!
//! A session walks `Probing → Quiescing → Transporting → Redefining →
//! Activating → Done`; any error ends it in `Failed(kind)` and is returned
//! as [`ShiftError::StageFailed`] naming the stage that was running. The
//! only retries are the shutdown poll inside [`ShutdownCoordinator`] and the
//! bounded credential re-collection while the source is being secured.

use crate::activation::VmActivator;
use crate::config::{ClusterConfig, ConfigField, ConfigStore};
use crate::credentials::{
    CredentialProvider, Credentials, FieldResolver, NoFieldResolver, StaticCredentialProvider,
};
use crate::definition::{DefinitionAction, DefinitionSync};
use crate::error::ErrorKind;
use crate::executor::{Host, RemoteExecutor};
use crate::live::LiveMigrationInvoker;
use crate::lock::ImageLockInspector;
use crate::probe::{self, HostProber};
use crate::settings::MigratorSettings;
use crate::shutdown::{QuiescePolicy, ShutdownCoordinator};
use crate::transport::{ImageCopier, Transport, resolve_shared_image};
use crate::virsh::{StorageMode, Virsh};
use crate::vm_image::VmImage;
use crate::{Result, ShiftError, log_error, log_info, log_warn};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Probing,
    Quiescing,
    Transporting,
    Redefining,
    Activating,
    Done,
    Failed(ErrorKind),
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Probing => f.write_str("probing"),
            MigrationState::Quiescing => f.write_str("quiescing"),
            MigrationState::Transporting => f.write_str("transporting"),
            MigrationState::Redefining => f.write_str("redefining"),
            MigrationState::Activating => f.write_str("activating"),
            MigrationState::Done => f.write_str("done"),
            MigrationState::Failed(kind) => write!(f, "failed ({:?})", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowMode {
    /// VM is stopped at the source and started here.
    Cold(Transport),
    /// The hypervisor streams the running VM here.
    Live(Transport),
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowMode::Cold(transport) => write!(f, "cold/{}", transport.as_str()),
            WorkflowMode::Live(transport) => write!(f, "live/{}", transport.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    Host(String),
    /// Every configured client except this host is checked for the image.
    ClusterScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    pub mode: WorkflowMode,
    pub source: SourceSelector,
    /// Image file name for cold migrations, VM name for live ones. A cold
    /// copy also accepts an absolute path on the source.
    pub target: String,
}

impl MigrationRequest {
    pub fn cold_shared(image: impl Into<String>, source: Option<String>) -> Self {
        Self {
            mode: WorkflowMode::Cold(Transport::SharedStorage),
            source: source.map_or(SourceSelector::ClusterScan, SourceSelector::Host),
            target: image.into(),
        }
    }

    pub fn cold_copy(host: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            mode: WorkflowMode::Cold(Transport::Copy),
            source: SourceSelector::Host(host.into()),
            target: image.into(),
        }
    }

    pub fn live(vm: impl Into<String>, host: impl Into<String>, transport: Transport) -> Self {
        Self {
            mode: WorkflowMode::Live(transport),
            source: SourceSelector::Host(host.into()),
            target: vm.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub session_id: Uuid,
    pub vm_name: String,
    pub mode: WorkflowMode,
    /// Host the VM came from; `None` when a cluster scan found no holder.
    pub source: Option<Host>,
    pub states: Vec<MigrationState>,
    pub auth_failures: u32,
    pub image_path: Option<PathBuf>,
    pub definition: Option<DefinitionAction>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct Session {
    id: Uuid,
    states: Vec<MigrationState>,
    auth_failures: u32,
    source: Option<Host>,
    image_path: Option<PathBuf>,
    definition: Option<DefinitionAction>,
    started_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            states: Vec::new(),
            auth_failures: 0,
            source: None,
            image_path: None,
            definition: None,
            started_at: Utc::now(),
        }
    }

    fn tag(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    fn current(&self) -> MigrationState {
        self.states.last().copied().unwrap_or(MigrationState::Probing)
    }

    fn enter(&mut self, state: MigrationState) {
        if self.states.last() != Some(&state) {
            log_info!("[{}] {}", self.tag(), state);
            self.states.push(state);
        }
    }
}

/// How the image is identified on the source host.
enum SourceImage<'a> {
    Path(&'a str),
    /// Located with `find` on the source first.
    Named(&'a str),
}

/// Precondition checked on the source while credentials may still be retried.
enum SourceCheck<'a> {
    /// Image must end up not in use, shutting its VM down if needed.
    Quiesce(SourceImage<'a>),
    /// VM must be known to the source hypervisor.
    Domain(&'a str),
}

struct SecuredSource {
    credentials: Credentials,
    image_path: Option<String>,
    /// Image was held open when first inspected.
    was_held: bool,
}

pub struct MigrationOrchestrator {
    executor: Arc<dyn RemoteExecutor>,
    prober: Arc<dyn HostProber>,
    store: Arc<dyn ConfigStore>,
    settings: MigratorSettings,
    virsh: Virsh,
    credentials: Box<dyn CredentialProvider>,
    fields: Box<dyn FieldResolver>,
    history: Vec<MigrationState>,
}

impl MigrationOrchestrator {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        prober: Arc<dyn HostProber>,
        store: Arc<dyn ConfigStore>,
        settings: MigratorSettings,
    ) -> Self {
        let virsh = Virsh::new(settings.libvirt.uri.clone());
        Self {
            executor,
            prober,
            store,
            settings,
            virsh,
            credentials: Box::new(StaticCredentialProvider::new(Credentials::local())),
            fields: Box::new(NoFieldResolver),
            history: Vec::new(),
        }
    }

    pub fn with_credentials(mut self, provider: Box<dyn CredentialProvider>) -> Self {
        self.credentials = provider;
        self
    }

    pub fn with_field_resolver(mut self, resolver: Box<dyn FieldResolver>) -> Self {
        self.fields = resolver;
        self
    }

    /// States visited by the most recent session, ending in `Done` or
    /// `Failed`.
    pub fn history(&self) -> &[MigrationState] {
        &self.history
    }

    pub async fn migrate(&mut self, request: MigrationRequest) -> Result<MigrationReport> {
        let mut session = Session::new();
        let vm_name = match request.mode {
            WorkflowMode::Cold(_) => VmImage::from_path(&request.target).name().to_string(),
            WorkflowMode::Live(_) => request.target.clone(),
        };
        log_info!(
            "[{}] Starting {} migration of '{}'",
            session.tag(),
            request.mode,
            vm_name
        );
        session.enter(MigrationState::Probing);

        let result = match request.mode {
            WorkflowMode::Cold(transport) => {
                self.run_cold(&mut session, &request, &vm_name, transport).await
            }
            WorkflowMode::Live(transport) => {
                self.run_live(&mut session, &request, &vm_name, transport).await
            }
        };

        if let Err(err) = result {
            let stage = session.current();
            log_error!("[{}] Migration of '{}' failed while {}: {}", session.tag(), vm_name, stage, err);
            session.states.push(MigrationState::Failed(err.kind()));
            self.history = session.states;
            return Err(ShiftError::StageFailed {
                stage,
                source: Box::new(err),
            });
        }

        session.enter(MigrationState::Done);
        if let Err(e) = self.store.add_vm_name(&vm_name) {
            log_warn!("Could not record '{}' in the cluster configuration: {}", vm_name, e);
        }
        log_info!("[{}] VM '{}' is running on this host", session.tag(), vm_name);

        self.history = session.states.clone();
        Ok(MigrationReport {
            session_id: session.id,
            vm_name,
            mode: request.mode,
            source: session.source,
            states: session.states,
            auth_failures: session.auth_failures,
            image_path: session.image_path,
            definition: session.definition,
            started_at: session.started_at,
            finished_at: Utc::now(),
        })
    }

    async fn run_cold(
        &mut self,
        session: &mut Session,
        request: &MigrationRequest,
        vm_name: &str,
        transport: Transport,
    ) -> Result<()> {
        let config = self.store.read()?;
        let xml_folder = self.require(&config, ConfigField::XmlFolder)?;

        let secured = match transport {
            Transport::SharedStorage => {
                let mount = self.require(&config, ConfigField::NfsPath)?;
                let image = resolve_shared_image(Path::new(&mount), &request.target)?;
                session.image_path = Some(image.clone());
                let image = image.to_string_lossy().into_owned();

                match &request.source {
                    SourceSelector::Host(address) => {
                        let host = self.reachable_host(vm_name, address).await?;
                        let secured = self
                            .secure_source(session, &host, SourceCheck::Quiesce(SourceImage::Path(&image)))
                            .await?;
                        Some((host, secured))
                    }
                    SourceSelector::ClusterScan => self.scan_cluster(session, &config, vm_name, &image).await?,
                }
            }
            Transport::Copy => {
                let local_vm_path = self.require(&config, ConfigField::LocalVmPath)?;
                let address = match &request.source {
                    SourceSelector::Host(address) => address,
                    SourceSelector::ClusterScan => {
                        return Err(ShiftError::InvalidConfig(
                            "copying an image needs an explicit source host".to_string(),
                        ));
                    }
                };
                let host = self.reachable_host(vm_name, address).await?;
                let image = if request.target.starts_with('/') {
                    SourceImage::Path(&request.target)
                } else {
                    SourceImage::Named(&request.target)
                };
                let secured = self
                    .secure_source(session, &host, SourceCheck::Quiesce(image))
                    .await?;

                session.enter(MigrationState::Transporting);
                let remote_path = secured.image_path.clone().unwrap_or_default();
                let local = ImageCopier::new(self.executor.clone())
                    .copy(&host, &secured.credentials, &remote_path, Path::new(&local_vm_path))
                    .await?;
                session.image_path = Some(local);
                Some((host, secured))
            }
        };

        if transport == Transport::SharedStorage {
            session.enter(MigrationState::Transporting);
            log_info!("Image is on shared storage, nothing to copy");
        }

        match secured {
            Some((host, secured)) => {
                session.enter(MigrationState::Redefining);
                let sync = DefinitionSync::new(
                    self.executor.clone(),
                    self.virsh.clone(),
                    xml_folder,
                    self.settings.libvirt.staging_dir.clone(),
                );
                let synced = sync
                    .sync_definition(vm_name, &host, &secured.credentials)
                    .await?;
                session.definition = Some(synced.action);
                session.source = Some(host);
            }
            None => log_info!("No host holds '{}', starting the local definition", vm_name),
        }

        session.enter(MigrationState::Activating);
        VmActivator::new(self.executor.clone(), self.virsh.clone())
            .start(vm_name)
            .await
    }

    async fn run_live(
        &mut self,
        session: &mut Session,
        request: &MigrationRequest,
        vm_name: &str,
        transport: Transport,
    ) -> Result<()> {
        let address = match &request.source {
            SourceSelector::Host(address) => address,
            SourceSelector::ClusterScan => {
                return Err(ShiftError::InvalidConfig(
                    "live migration needs an explicit source host".to_string(),
                ));
            }
        };

        let storage = match transport {
            Transport::SharedStorage => {
                let config = self.store.read()?;
                let mount = self.require(&config, ConfigField::NfsPath)?;
                let image = resolve_shared_image(Path::new(&mount), &format!("{}.img", vm_name))?;
                session.image_path = Some(image);
                StorageMode::Shared
            }
            Transport::Copy => StorageMode::Copy,
        };

        let destination = self
            .local_address()
            .ok_or_else(|| ShiftError::ConfigurationMissing("local_address".to_string()))?;

        let host = self.reachable_host(vm_name, address).await?;
        let secured = self
            .secure_source(session, &host, SourceCheck::Domain(vm_name))
            .await?;

        session.enter(MigrationState::Activating);
        let invoker = LiveMigrationInvoker::new(
            self.executor.clone(),
            self.virsh.clone(),
            self.settings.live.clone(),
        );
        invoker
            .live_migrate(
                vm_name,
                &host,
                &secured.credentials,
                secured.credentials.username(),
                &destination,
                storage,
                invoker.port_for(storage),
            )
            .await?;
        session.source = Some(host);
        Ok(())
    }

    /// Shared-storage source discovery. The first reachable client where the
    /// image is not confirmed free is quiesced and becomes the source.
    async fn scan_cluster(
        &mut self,
        session: &mut Session,
        config: &ClusterConfig,
        vm_name: &str,
        image: &str,
    ) -> Result<Option<(Host, SecuredSource)>> {
        let clients = self.require(config, ConfigField::ClientIps)?;
        let local = self.local_address();
        log_info!(
            "Before migrating {} make sure SSH is enabled on every VM host in the network and the firewall allows it",
            vm_name
        );

        for address in clients.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            if probe::is_local_address(address, local.as_deref()) {
                log_info!("Skipping local host: {}", address);
                continue;
            }
            if !self.prober.probe(address).await {
                log_warn!("Skipping unreachable host {}", address);
                continue;
            }

            let host = Host::remote(address);
            let secured = self
                .secure_source(session, &host, SourceCheck::Quiesce(SourceImage::Path(image)))
                .await?;
            if secured.was_held {
                return Ok(Some((host, secured)));
            }
        }

        Ok(None)
    }

    async fn reachable_host(&self, vm_name: &str, address: &str) -> Result<Host> {
        log_info!(
            "Before migrating {} from {} make sure SSH is enabled on that host and the firewall allows it",
            vm_name,
            address
        );
        if !self.prober.probe(address).await {
            return Err(ShiftError::HostUnreachable(address.to_string()));
        }
        Ok(Host::remote(address))
    }

    /// Runs `check` on `host`, collecting fresh credentials each time the
    /// previous ones were rejected, up to `auth_retry_limit` collections.
    async fn secure_source(
        &mut self,
        session: &mut Session,
        host: &Host,
        check: SourceCheck<'_>,
    ) -> Result<SecuredSource> {
        let limit = self.settings.auth_retry_limit;
        let mut attempt = 1;

        loop {
            let credentials = self.credentials.credentials(host.address(), attempt)?;
            match self.check_source(session, host, &credentials, &check).await {
                Ok((image_path, was_held)) => {
                    return Ok(SecuredSource {
                        credentials,
                        image_path,
                        was_held,
                    });
                }
                Err(err) if err.is_authentication() => {
                    session.auth_failures += 1;
                    if attempt >= limit {
                        return Err(err);
                    }
                    log_warn!("{} (attempt {}/{})", err, attempt, limit);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn check_source(
        &self,
        session: &mut Session,
        host: &Host,
        credentials: &Credentials,
        check: &SourceCheck<'_>,
    ) -> Result<(Option<String>, bool)> {
        let image = match check {
            SourceCheck::Domain(vm_name) => {
                let command = self.virsh.dominfo(vm_name).as_privileged();
                let output = self.executor.run(host, credentials, &command, None).await?;
                if !output.success() {
                    return Err(ShiftError::VmNotFound(format!("{} on {}", vm_name, host)));
                }
                return Ok((None, false));
            }
            SourceCheck::Quiesce(SourceImage::Path(path)) => path.to_string(),
            SourceCheck::Quiesce(SourceImage::Named(name)) => {
                ImageCopier::new(self.executor.clone())
                    .locate(host, credentials, name)
                    .await?
            }
        };

        let inspector = ImageLockInspector::new(
            self.executor.clone(),
            self.settings.shutdown.lock_check_timeout(),
        );
        let outcome = inspector.is_in_use(host, credentials, &image).await?;
        if outcome.is_free() {
            log_info!("Image {} is not in use on {}", image, host);
            return Ok((Some(image), false));
        }

        log_info!("Image {} is {} on {}", image, outcome, host);
        session.enter(MigrationState::Quiescing);
        let coordinator = ShutdownCoordinator::new(
            self.executor.clone(),
            inspector,
            self.virsh.clone(),
            QuiescePolicy::from(&self.settings.shutdown),
        );
        coordinator.ensure_quiesced(host, credentials, &image).await?;
        Ok((Some(image), true))
    }

    /// Value of a required cluster field, asking the resolver and persisting
    /// the answer when the record lacks it.
    fn require(&mut self, config: &ClusterConfig, field: ConfigField) -> Result<String> {
        if let Some(value) = config.field(field) {
            return Ok(value);
        }

        match self.fields.resolve(field)? {
            Some(value) if !value.trim().is_empty() => {
                let update = ClusterConfig::with_field(field, &value);
                let resolved = update.field(field).unwrap_or_default();
                self.store.write(update)?;
                Ok(resolved)
            }
            _ => Err(ShiftError::ConfigurationMissing(field.key().to_string())),
        }
    }

    fn local_address(&self) -> Option<String> {
        self.settings.local_address.clone().or_else(probe::local_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::testing::{Reply, ScriptedCredentials, ScriptedExecutor, StaticProber};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct QueuedFields(VecDeque<Option<String>>);

    impl FieldResolver for QueuedFields {
        fn resolve(&mut self, _field: ConfigField) -> Result<Option<String>> {
            Ok(self.0.pop_front().flatten())
        }
    }

    fn orchestrator(
        executor: Arc<ScriptedExecutor>,
        store: Arc<MemoryConfigStore>,
    ) -> MigrationOrchestrator {
        let settings = MigratorSettings {
            local_address: Some("10.0.0.2".to_string()),
            ..MigratorSettings::default()
        };
        MigrationOrchestrator::new(
            executor,
            Arc::new(StaticProber::reachable(["10.0.0.5"])),
            store,
            settings,
        )
        .with_credentials(Box::new(ScriptedCredentials::new([Credentials::new("ops", "pw")])))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(MigrationState::Redefining.to_string(), "redefining");
        assert_eq!(
            MigrationState::Failed(ErrorKind::CopyFailure).to_string(),
            "failed (CopyFailure)"
        );
    }

    #[test]
    fn test_request_constructors() {
        assert_eq!(
            MigrationRequest::cold_shared("web01.img", None).source,
            SourceSelector::ClusterScan
        );
        let copy = MigrationRequest::cold_copy("10.0.0.5", "web01.img");
        assert_eq!(copy.mode, WorkflowMode::Cold(Transport::Copy));
        assert_eq!(copy.source, SourceSelector::Host("10.0.0.5".to_string()));
    }

    #[tokio::test]
    async fn test_resolved_field_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryConfigStore::new(ClusterConfig {
            xml_folder: Some(dir.path().join("xml")),
            ..ClusterConfig::default()
        }));
        let vms = dir.path().join("vms");
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("fuser", Reply::exit(1, ""));
        let mut orchestrator = orchestrator(executor, store.clone())
            .with_field_resolver(Box::new(QueuedFields(VecDeque::from([Some(
                vms.display().to_string(),
            )]))));

        let report = orchestrator
            .migrate(MigrationRequest::cold_copy("10.0.0.5", "/var/lib/libvirt/images/web01.img"))
            .await
            .unwrap();

        assert_eq!(store.snapshot().local_vm_path, Some(vms.clone()));
        assert_eq!(report.image_path, Some(vms.join("web01.img")));
        assert!(store.snapshot().has_vm("web01"));
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_while_probing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryConfigStore::new(ClusterConfig {
            xml_folder: Some(dir.path().join("xml")),
            local_vm_path: Some(dir.path().join("vms")),
            ..ClusterConfig::default()
        }));
        let executor = Arc::new(ScriptedExecutor::new());
        let mut orchestrator = orchestrator(executor.clone(), store);

        let err = orchestrator
            .migrate(MigrationRequest::cold_copy("10.0.0.77", "web01.img"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HostUnreachable);
        assert_eq!(err.failed_stage(), Some(MigrationState::Probing));
        assert_eq!(
            orchestrator.history(),
            &[MigrationState::Probing, MigrationState::Failed(ErrorKind::HostUnreachable)]
        );
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_auth_ceiling_is_respected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryConfigStore::new(ClusterConfig {
            xml_folder: Some(dir.path().join("xml")),
            local_vm_path: Some(dir.path().join("vms")),
            ..ClusterConfig::default()
        }));
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("fuser", Reply::AuthRejected);
        let credentials = ScriptedCredentials::new([Credentials::new("ops", "wrong")]);
        let requests = credentials.requests();

        let mut orchestrator = orchestrator(executor.clone(), store).with_credentials(Box::new(credentials));
        let err = orchestrator
            .migrate(MigrationRequest::cold_copy("10.0.0.5", "/images/web01.img"))
            .await
            .unwrap_err();

        assert!(err.is_authentication());
        assert_eq!(requests.lock().unwrap().len(), 3);
        assert_eq!(executor.count("fuser"), 3);
        assert!(executor.copies().is_empty());
    }
}
