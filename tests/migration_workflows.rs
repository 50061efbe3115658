// End-to-end workflow tests against scripted hosts
mod common;

use common::{Cluster, LOCAL_IP};
use std::sync::Arc;
use vmshift::config::{ClusterConfig, MemoryConfigStore};
use vmshift::credentials::Credentials;
use vmshift::definition::DefinitionAction;
use vmshift::testing::{Reply, ScriptedCredentials};
use vmshift::{ErrorKind, Host, MigrationRequest, MigrationState, ShiftError, Transport};

use MigrationState::*;

fn free() -> Reply {
    Reply::exit(1, "")
}

fn in_use() -> Reply {
    Reply::ok("4242")
}

#[tokio::test]
async fn test_shared_storage_cold_migration_of_idle_vm() {
    let cluster = Cluster::new(&["10.0.0.5"]);
    let image = cluster.add_image("web01.img");
    cluster.executor.on("fuser", free());
    cluster.executor.on("dominfo", Reply::exit(1, "error: failed to get domain 'web01'"));

    let mut orchestrator = cluster.orchestrator();
    let report = orchestrator
        .migrate(MigrationRequest::cold_shared("web01.img", Some("10.0.0.5".to_string())))
        .await
        .expect("migration should succeed");

    assert_eq!(report.states, vec![Probing, Transporting, Redefining, Activating, Done]);
    assert_eq!(orchestrator.history(), report.states.as_slice());
    assert_eq!(report.vm_name, "web01");
    assert_eq!(report.source, Some(Host::remote("10.0.0.5")));
    assert_eq!(report.image_path, Some(image.clone()));
    assert_eq!(report.definition, Some(DefinitionAction::Defined));
    assert_eq!(report.auth_failures, 0);

    let calls = cluster.executor.calls();
    let lock_check = calls.iter().find(|c| c.script.starts_with("fuser")).unwrap();
    assert_eq!(lock_check.host, Host::remote("10.0.0.5"));
    assert!(lock_check.script.contains(&image.display().to_string()));

    let start = calls.iter().find(|c| c.script.contains("start web01")).unwrap();
    assert!(start.host.is_local());
    assert_eq!(cluster.executor.count("shutdown"), 0);
    assert!(cluster.xml().join("web01.xml").is_file());
    assert!(cluster.store.snapshot().has_vm("web01"));
}

#[tokio::test]
async fn test_vm_that_never_releases_its_image_is_not_started() {
    let cluster = Cluster::new(&["10.0.0.9"]);
    cluster.add_image("db01.img");
    cluster.executor.on("fuser", in_use());

    let mut orchestrator = cluster.orchestrator();
    let err = orchestrator
        .migrate(MigrationRequest::cold_shared("db01.img", Some("10.0.0.9".to_string())))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StillInUseTimeout);
    assert_eq!(err.failed_stage(), Some(Quiescing));
    assert_eq!(
        orchestrator.history(),
        &[Probing, Quiescing, Failed(ErrorKind::StillInUseTimeout)]
    );

    // One inspection before quiescing, then the full poll budget.
    assert_eq!(cluster.executor.count("fuser"), 13);
    assert_eq!(cluster.executor.count("shutdown db01"), 1);
    assert_eq!(cluster.executor.count("dumpxml"), 0);
    assert_eq!(cluster.executor.count(" define "), 0);
    assert_eq!(cluster.executor.count("start db01"), 0);
    assert!(!cluster.store.snapshot().has_vm("db01"));
}

#[tokio::test]
async fn test_rejected_credentials_are_collected_again() {
    let cluster = Cluster::new(&["10.0.0.5"]);
    cluster.add_image("web01.img");
    cluster.executor.on_sequence("fuser", [Reply::AuthRejected, free()]);

    let credentials = ScriptedCredentials::new([
        Credentials::new("ops", "wrong"),
        Credentials::new("ops", "secret"),
    ]);
    let requests = credentials.requests();

    let report = cluster
        .orchestrator_with(credentials)
        .migrate(MigrationRequest::cold_shared("web01.img", Some("10.0.0.5".to_string())))
        .await
        .expect("second credentials should be accepted");

    assert_eq!(report.auth_failures, 1);
    assert_eq!(
        *requests.lock().unwrap(),
        vec![("10.0.0.5".to_string(), 1), ("10.0.0.5".to_string(), 2)]
    );
    assert_eq!(report.states.last(), Some(&Done));
    assert_eq!(cluster.executor.count("start web01"), 1);
}

#[tokio::test]
async fn test_failed_live_migration_touches_nothing_locally() {
    let cluster = Cluster::new(&["10.0.0.5"]);
    cluster.executor.on(
        "migrate --live",
        Reply::exit(1, "error: internal error: unable to execute QEMU command 'migrate'"),
    );

    let mut orchestrator = cluster.orchestrator();
    let err = orchestrator
        .migrate(MigrationRequest::live("web01", "10.0.0.5", Transport::Copy))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::LiveMigrationFailure);
    assert!(err.to_string().contains("unable to execute QEMU command"));
    assert_eq!(
        orchestrator.history(),
        &[Probing, Activating, Failed(ErrorKind::LiveMigrationFailure)]
    );

    assert_eq!(cluster.executor.count("migrate --live"), 1);
    assert_eq!(cluster.executor.count("undefine"), 0);
    assert_eq!(cluster.executor.count(" define "), 0);
    assert!(cluster.executor.calls().iter().all(|c| !c.host.is_local()));
    assert!(!cluster.store.snapshot().has_vm("web01"));
}

#[tokio::test]
async fn test_live_migration_over_shared_storage() {
    let cluster = Cluster::new(&["10.0.0.5"]);
    cluster.add_image("web01.img");

    let report = cluster
        .orchestrator()
        .migrate(MigrationRequest::live("web01", "10.0.0.5", Transport::SharedStorage))
        .await
        .expect("live migration should succeed");

    assert_eq!(report.states, vec![Probing, Activating, Done]);
    let migrate = cluster
        .executor
        .calls()
        .into_iter()
        .find(|c| c.script.contains("migrate --live"))
        .unwrap();
    assert_eq!(migrate.host, Host::remote("10.0.0.5"));
    assert!(migrate.privileged);
    assert!(migrate.script.contains(&format!("qemu+ssh://ops@{}/system", LOCAL_IP)));
    assert!(migrate.script.contains(&format!("tcp://{}:49152", LOCAL_IP)));
    assert!(!migrate.script.contains("--copy-storage-all"));
    assert!(cluster.store.snapshot().has_vm("web01"));
}

#[tokio::test]
async fn test_live_shared_storage_needs_image_on_mount() {
    let cluster = Cluster::new(&["10.0.0.5"]);

    let err = cluster
        .orchestrator()
        .migrate(MigrationRequest::live("web01", "10.0.0.5", Transport::SharedStorage))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ImageNotFound);
    assert!(cluster.executor.calls().is_empty());
}

#[tokio::test]
async fn test_missing_mount_fails_fast() {
    let mut cluster = Cluster::new(&["10.0.0.5"]);
    cluster.store = Arc::new(MemoryConfigStore::new(ClusterConfig {
        xml_folder: Some(cluster.xml()),
        ..ClusterConfig::default()
    }));

    let mut orchestrator = cluster.orchestrator();
    let err = orchestrator
        .migrate(MigrationRequest::cold_shared("web01.img", Some("10.0.0.5".to_string())))
        .await
        .unwrap_err();

    match &err {
        ShiftError::StageFailed { stage, source } => {
            assert_eq!(*stage, Probing);
            assert!(matches!(**source, ShiftError::ConfigurationMissing(ref key) if key == "nfs_path"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(cluster.executor.calls().is_empty());
    assert!(cluster.prober.probes().is_empty());
}

#[tokio::test]
async fn test_cluster_scan_quiesces_the_holder() {
    let cluster = Cluster::new(&["10.0.0.5", "10.0.0.9"]).with_config(ClusterConfig {
        client_ips: Some(vec![
            LOCAL_IP.to_string(),
            "10.0.0.7".to_string(),
            "10.0.0.5".to_string(),
            "10.0.0.9".to_string(),
        ]),
        ..ClusterConfig::default()
    });
    cluster.add_image("web01.img");
    // Free on 10.0.0.5; held on 10.0.0.9 until the first poll.
    cluster.executor.on_sequence("fuser", [free(), in_use(), free()]);

    let report = cluster
        .orchestrator()
        .migrate(MigrationRequest::cold_shared("web01.img", None))
        .await
        .expect("scan should find and stop the holder");

    assert_eq!(
        report.states,
        vec![Probing, Quiescing, Transporting, Redefining, Activating, Done]
    );
    assert_eq!(report.source, Some(Host::remote("10.0.0.9")));
    assert_eq!(cluster.prober.probes(), vec!["10.0.0.7", "10.0.0.5", "10.0.0.9"]);

    let shutdown = cluster
        .executor
        .calls()
        .into_iter()
        .find(|c| c.script.contains("shutdown web01"))
        .unwrap();
    assert_eq!(shutdown.host, Host::remote("10.0.0.9"));
    assert_eq!(cluster.executor.copies()[0].host, Host::remote("10.0.0.9"));
}

#[tokio::test]
async fn test_cluster_scan_without_holder_starts_local_definition() {
    let cluster = Cluster::new(&["10.0.0.5"]).with_config(ClusterConfig {
        client_ips: Some(vec![LOCAL_IP.to_string(), "10.0.0.5".to_string()]),
        ..ClusterConfig::default()
    });
    cluster.add_image("web01.img");
    cluster.executor.on("fuser", free());

    let report = cluster
        .orchestrator()
        .migrate(MigrationRequest::cold_shared("web01.img", None))
        .await
        .expect("idle VM should just be started");

    assert_eq!(report.states, vec![Probing, Transporting, Activating, Done]);
    assert_eq!(report.source, None);
    assert!(cluster.executor.copies().is_empty());
    assert_eq!(cluster.executor.count("start web01"), 1);
}

#[tokio::test]
async fn test_copy_migration_is_idempotent_on_rerun() {
    let cluster = Cluster::new(&["10.0.0.5"]);
    cluster.executor.on(
        "find / -type f -name web01.img",
        Reply::ok("/var/lib/libvirt/images/web01.img\n"),
    );
    cluster.executor.on("fuser", free());
    cluster
        .executor
        .on_sequence("dominfo", [Reply::exit(1, "error: failed to get domain"), Reply::ok("Name: web01")]);
    // Local dump matches what the scripted copy delivers for the definition.
    cluster
        .executor
        .on("qemu:///system dumpxml web01", Reply::ok("copy of /tmp/vmshift/web01.xml"));

    let mut orchestrator = cluster.orchestrator();
    let first = orchestrator
        .migrate(MigrationRequest::cold_copy("10.0.0.5", "web01.img"))
        .await
        .expect("first run should succeed");
    assert_eq!(first.states, vec![Probing, Transporting, Redefining, Activating, Done]);
    assert_eq!(first.definition, Some(DefinitionAction::Defined));
    assert_eq!(first.image_path, Some(cluster.vms().join("web01.img")));
    assert_eq!(
        std::fs::read_to_string(cluster.vms().join("web01.img")).unwrap(),
        "copy of /var/lib/libvirt/images/web01.img"
    );

    let second = orchestrator
        .migrate(MigrationRequest::cold_copy("10.0.0.5", "web01.img"))
        .await
        .expect("rerun should succeed");
    assert_eq!(second.definition, Some(DefinitionAction::Unchanged));
    assert_ne!(first.session_id, second.session_id);

    assert_eq!(cluster.executor.count(" define "), 1);
    assert_eq!(cluster.executor.count("undefine"), 0);
}

#[tokio::test]
async fn test_member_that_cannot_see_the_image_is_not_treated_as_free() {
    let cluster = Cluster::new(&["10.0.0.5"]).with_config(ClusterConfig {
        client_ips: Some(vec![LOCAL_IP.to_string(), "10.0.0.5".to_string()]),
        ..ClusterConfig::default()
    });
    let image = cluster.add_image("web01.img");
    // Mounted elsewhere on that host, so fuser cannot look at this path.
    cluster.executor.on(
        "fuser",
        Reply::exit(1, format!("Specified filename {} does not exist.", image.display())),
    );

    let mut orchestrator = cluster.orchestrator();
    let err = orchestrator
        .migrate(MigrationRequest::cold_shared("web01.img", None))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::StillInUseTimeout);
    assert_eq!(
        orchestrator.history(),
        &[Probing, Quiescing, Failed(ErrorKind::StillInUseTimeout)]
    );
    assert_eq!(cluster.executor.count("shutdown web01"), 1);
    assert_eq!(cluster.executor.count("start web01"), 0);
}
