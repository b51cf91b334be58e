//! End-to-end coordinator tests over in-memory store adapters.
//!
//! These cover the full backup → archive → restore → verify path, the
//! destructive-restore guard, integrity rejection of tampered archives, and
//! the degraded/rollback behaviours, without a live stack.

use memvault_core::adapter::MockStoreAdapter;
use memvault_core::config::{
    ApiEndpoint, GraphConfig, RelationalConfig, ServicesConfig, StackConfig, VectorConfig,
};
use memvault_core::{
    archive, integrity, ArchiveMetadata, BackupCoordinator, BackupOptions, BackupPhase,
    RestoreCoordinator, RestoreOptions, RestorePhase, RunLock, ServiceControl,
    StaticServiceControl, StoreAdapter,
    StoreKind, VaultError, VerifyStatus,
};
use memvault_health::PollPolicy;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn test_config(backup_dir: &Path) -> StackConfig {
    StackConfig {
        vector: VectorConfig {
            url: "http://localhost:6333".to_string(),
            api_key: None,
        },
        relational: RelationalConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            databases: vec!["mem0".to_string()],
        },
        graph: GraphConfig {
            url: "http://localhost:7474".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: "neo4j".to_string(),
        },
        services: ServicesConfig {
            compose_dir: backup_dir.to_path_buf(),
            write_path: vec!["mem0-api".to_string(), "mem0-webui".to_string()],
            vector_service: "mem0-qdrant".to_string(),
            relational_service: "mem0-postgres".to_string(),
            graph_service: "mem0-neo4j".to_string(),
        },
        api_endpoints: Vec::<ApiEndpoint>::new(),
        backup_dir: backup_dir.to_path_buf(),
    }
}

/// A small but representative stack: 2 vector collections (10 and 0 points), one
/// relational database, a graph with content.
fn seeded_mocks() -> (MockStoreAdapter, MockStoreAdapter, MockStoreAdapter) {
    let vector = MockStoreAdapter::new(StoreKind::Vector)
        .with_unit("memories", 10)
        .with_unit("scratch", 0);
    let relational = MockStoreAdapter::new(StoreKind::Relational).with_unit("mem0", 3);
    let graph = MockStoreAdapter::new(StoreKind::Graph).with_unit("graph", 5);
    (vector, relational, graph)
}

fn empty_mocks() -> (MockStoreAdapter, MockStoreAdapter, MockStoreAdapter) {
    (
        MockStoreAdapter::new(StoreKind::Vector),
        MockStoreAdapter::new(StoreKind::Relational),
        MockStoreAdapter::new(StoreKind::Graph),
    )
}

fn boxed(
    mocks: &(MockStoreAdapter, MockStoreAdapter, MockStoreAdapter),
) -> Vec<Box<dyn StoreAdapter>> {
    vec![
        Box::new(mocks.0.clone()),
        Box::new(mocks.1.clone()),
        Box::new(mocks.2.clone()),
    ]
}

fn all_services() -> StaticServiceControl {
    StaticServiceControl::with_running([
        "mem0-api",
        "mem0-webui",
        "mem0-qdrant",
        "mem0-postgres",
        "mem0-neo4j",
    ])
}

fn short_policy() -> PollPolicy {
    PollPolicy::new(Duration::from_millis(100), Duration::from_millis(20))
}

async fn run_backup(dir: &Path) -> std::path::PathBuf {
    let mocks = seeded_mocks();
    let coordinator = BackupCoordinator::new(test_config(dir), boxed(&mocks), Box::new(all_services()))
        .with_poll_policy(short_policy());
    let outcome = coordinator
        .run(&BackupOptions {
            name: Some("test".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    outcome.archive_path
}

#[tokio::test]
async fn backup_produces_self_consistent_archive() {
    let dir = TempDir::new().unwrap();
    let mocks = seeded_mocks();
    let coordinator = BackupCoordinator::new(
        test_config(dir.path()),
        boxed(&mocks),
        Box::new(StaticServiceControl::with_running(["mem0-api", "mem0-webui"])),
    )
    .with_poll_policy(short_policy());

    let outcome = coordinator
        .run(&BackupOptions {
            name: Some("nightly".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(coordinator.phase(), BackupPhase::Done);
    assert!(!outcome.is_degraded());
    assert!(outcome.archive_path.exists());

    // Exactly the scenario manifest: 2 vector collections, 1 database, 1 graph.
    let metadata = &outcome.metadata;
    assert_eq!(
        metadata
            .store(StoreKind::Vector)
            .unwrap()
            .captured_units()
            .count(),
        2
    );
    assert_eq!(
        metadata
            .store(StoreKind::Relational)
            .unwrap()
            .captured_units()
            .count(),
        1
    );
    assert_eq!(
        metadata
            .store(StoreKind::Graph)
            .unwrap()
            .captured_units()
            .count(),
        1
    );

    // Checksum self-consistency: reverify immediately after unpacking.
    let unpacked = TempDir::new().unwrap();
    archive::unpack(&outcome.archive_path, unpacked.path()).unwrap();
    let checksums = integrity::load_checksum_file(unpacked.path()).unwrap();
    integrity::verify_checksums(unpacked.path(), &checksums).unwrap();

    // One entry per payload file (4 store files + metadata.json).
    assert_eq!(checksums.len(), 5);
    assert!(checksums.contains_key("metadata.json"));

    let loaded = ArchiveMetadata::load(unpacked.path()).unwrap();
    assert_eq!(&loaded, metadata);
}

#[tokio::test]
async fn backup_stops_and_restarts_write_path() {
    let dir = TempDir::new().unwrap();
    let mocks = seeded_mocks();
    // Keep a handle so the calls can be inspected after the run.
    let services = Arc::new(StaticServiceControl::with_running(["mem0-api", "mem0-webui"]));
    let coordinator = BackupCoordinator::new(
        test_config(dir.path()),
        boxed(&mocks),
        Box::new(services.clone()),
    )
    .with_poll_policy(short_policy());

    coordinator
        .run(&BackupOptions {
            name: Some("quiesce".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let calls = services.calls();
    assert!(calls.contains(&"stop mem0-api".to_string()));
    assert!(calls.contains(&"start mem0-api".to_string()));
    assert!(calls.contains(&"stop mem0-webui".to_string()));
    assert!(calls.contains(&"start mem0-webui".to_string()));
    // Both services are running again at the end.
    assert!(services.is_running("mem0-api").await.unwrap());
    assert!(services.is_running("mem0-webui").await.unwrap());
}

#[tokio::test]
async fn restore_roundtrip_reproduces_cardinalities() {
    let dir = TempDir::new().unwrap();
    let archive_path = run_backup(dir.path()).await;

    let source = seeded_mocks();
    let target = empty_mocks();
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());

    let outcome = coordinator
        .run(&archive_path, &RestoreOptions::default())
        .await
        .unwrap();

    assert_eq!(coordinator.phase(), RestorePhase::Done);
    assert_eq!(
        outcome.loaded,
        vec![StoreKind::Relational, StoreKind::Vector, StoreKind::Graph]
    );
    // Round-trip property: N elements in, N elements out.
    assert_eq!(target.0.unit_counts(), source.0.unit_counts());
    assert_eq!(target.1.unit_counts(), source.1.unit_counts());
    assert_eq!(target.2.unit_counts(), source.2.unit_counts());

    let report = outcome.verification.expect("verification ran");
    assert_eq!(report.status(), VerifyStatus::Pass);
}

#[tokio::test]
async fn restore_without_force_aborts_before_any_adapter_call() {
    let dir = TempDir::new().unwrap();
    let archive_path = run_backup(dir.path()).await;

    // Relational target already holds data.
    let target = empty_mocks();
    let target = (target.0, target.1.with_unit("mem0", 1), target.2);
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());

    let err = coordinator
        .run(&archive_path, &RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    assert!(err.to_string().contains("relational"));

    // The guard fired before any adapter restore was invoked.
    assert_eq!(target.0.restore_invocations(), 0);
    assert_eq!(target.1.restore_invocations(), 0);
    assert_eq!(target.2.restore_invocations(), 0);

    // --force overrides the guard.
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());
    coordinator
        .run(
            &archive_path,
            &RestoreOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(target.1.unit_counts().get("mem0"), Some(&3));
}

#[tokio::test]
async fn tampered_archive_is_rejected_without_mutation() {
    let dir = TempDir::new().unwrap();
    let archive_path = run_backup(dir.path()).await;

    // Flip one byte in a payload file and repack.
    let unpacked = TempDir::new().unwrap();
    archive::unpack(&archive_path, unpacked.path()).unwrap();
    let victim = unpacked.path().join("relational/mem0.json");
    let mut bytes = std::fs::read(&victim).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&victim, bytes).unwrap();
    let tampered = dir.path().join("memvault-tampered.tar.gz");
    archive::pack(unpacked.path(), &tampered).unwrap();

    let target = empty_mocks();
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());

    let err = coordinator
        .run(&tampered, &RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Integrity(_)));
    assert_eq!(target.0.restore_invocations(), 0);
    assert_eq!(target.1.restore_invocations(), 0);
    assert_eq!(target.2.restore_invocations(), 0);
}

#[tokio::test]
async fn health_timeout_during_restore_leaves_stores_untouched() {
    let dir = TempDir::new().unwrap();
    let archive_path = run_backup(dir.path()).await;

    let target = empty_mocks();
    let target = (target.0, target.1, target.2.unreachable());
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());

    let err = coordinator
        .run(&archive_path, &RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::HealthTimeout(_)));
    assert_eq!(coordinator.phase(), RestorePhase::RolledBack);
    assert_eq!(target.0.restore_invocations(), 0);
    assert_eq!(target.1.restore_invocations(), 0);
}

#[tokio::test]
async fn restore_failure_rolls_back_and_stops_started_services() {
    let dir = TempDir::new().unwrap();
    let archive_path = run_backup(dir.path()).await;

    let target = empty_mocks();
    let target = (target.0, target.1, target.2.fail_restore_of("graph"));
    let services = Arc::new(StaticServiceControl::new());
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(services.clone()),
    )
    .with_poll_policy(short_policy());

    let err = coordinator
        .run(&archive_path, &RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Restore { .. }));
    assert!(err.to_string().contains("graph"));
    assert_eq!(coordinator.phase(), RestorePhase::RolledBack);

    // Stop-and-report: completed loads stay in place.
    assert_eq!(target.1.unit_counts().get("mem0"), Some(&3));
    assert_eq!(target.0.unit_counts().get("memories"), Some(&10));

    // Services this run started are stopped again.
    assert!(!services.is_running("mem0-postgres").await.unwrap());
    assert!(!services.is_running("mem0-qdrant").await.unwrap());
    assert!(!services.is_running("mem0-neo4j").await.unwrap());
}

#[tokio::test]
async fn degraded_backup_records_failure_and_rest_restores() {
    let dir = TempDir::new().unwrap();
    let vector = MockStoreAdapter::new(StoreKind::Vector)
        .with_unit("memories", 10)
        .with_unit("scratch", 4)
        .with_unit("broken", 7)
        .fail_capture_of("broken");
    let mocks = (
        vector,
        MockStoreAdapter::new(StoreKind::Relational).with_unit("mem0", 3),
        MockStoreAdapter::new(StoreKind::Graph).with_unit("graph", 5),
    );
    let coordinator = BackupCoordinator::new(
        test_config(dir.path()),
        boxed(&mocks),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());

    let outcome = coordinator
        .run(&BackupOptions {
            name: Some("degraded".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(coordinator.phase(), BackupPhase::Done);
    assert!(outcome.is_degraded());
    let vector_manifest = outcome.metadata.store(StoreKind::Vector).unwrap();
    assert_eq!(vector_manifest.captured_units().count(), 2);
    let failed: Vec<&str> = vector_manifest
        .failed_units()
        .map(|u| u.name.as_str())
        .collect();
    assert_eq!(failed, vec!["broken"]);

    // The two captured collections restore correctly later.
    let target = empty_mocks();
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());
    coordinator
        .run(&outcome.archive_path, &RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(target.0.unit_counts().get("memories"), Some(&10));
    assert_eq!(target.0.unit_counts().get("scratch"), Some(&4));
    assert!(!target.0.unit_counts().contains_key("broken"));
}

#[tokio::test]
async fn backup_with_no_capturable_store_fails() {
    let dir = TempDir::new().unwrap();
    let mocks = (
        MockStoreAdapter::new(StoreKind::Vector).unreachable(),
        MockStoreAdapter::new(StoreKind::Relational).unreachable(),
        MockStoreAdapter::new(StoreKind::Graph).unreachable(),
    );
    let coordinator = BackupCoordinator::new(
        test_config(dir.path()),
        boxed(&mocks),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());

    let err = coordinator
        .run(&BackupOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    assert_eq!(coordinator.phase(), BackupPhase::Failed);

    // The partial staging directory is gone and the lock was released.
    assert!(RunLock::acquire(dir.path()).is_ok());
}

#[tokio::test]
async fn concurrent_runs_are_mutually_excluded() {
    let dir = TempDir::new().unwrap();
    let _held = RunLock::acquire(dir.path()).unwrap();

    let mocks = seeded_mocks();
    let coordinator = BackupCoordinator::new(
        test_config(dir.path()),
        boxed(&mocks),
        Box::new(all_services()),
    )
    .with_poll_policy(short_policy());
    let err = coordinator
        .run(&BackupOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Locked { .. }));
}

#[tokio::test]
async fn backup_plan_lists_discovered_units() {
    let dir = TempDir::new().unwrap();
    let mocks = seeded_mocks();
    let coordinator = BackupCoordinator::new(
        test_config(dir.path()),
        boxed(&mocks),
        Box::new(all_services()),
    );

    let plan = coordinator
        .plan(&BackupOptions {
            name: Some("plan".to_string()),
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(plan
        .archive_path
        .to_string_lossy()
        .ends_with("memvault-plan.tar.gz"));
    let vector_units = plan
        .stores
        .iter()
        .find(|(kind, _)| *kind == StoreKind::Vector)
        .and_then(|(_, units)| units.as_ref().ok())
        .unwrap();
    assert_eq!(vector_units, &vec!["memories".to_string(), "scratch".to_string()]);
}

/// Store adapter that cancels the given token when its capture starts, to
/// abort a run while the write path is stopped.
struct CancellingAdapter {
    inner: MockStoreAdapter,
    cancel: CancellationToken,
}

#[async_trait]
impl StoreAdapter for CancellingAdapter {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    async fn discover(&self) -> memvault_core::Result<Vec<String>> {
        self.inner.discover().await
    }

    async fn capture(
        &self,
        dest: &Path,
    ) -> memvault_core::Result<memvault_core::StoreManifest> {
        self.cancel.cancel();
        self.inner.capture(dest).await
    }

    async fn restore(
        &self,
        src: &Path,
        manifest: &memvault_core::StoreManifest,
    ) -> memvault_core::Result<()> {
        self.inner.restore(src, manifest).await
    }

    async fn is_empty(&self) -> memvault_core::Result<bool> {
        self.inner.is_empty().await
    }

    async fn probe(&self) -> memvault_core::Result<()> {
        self.inner.probe().await
    }

    async fn cardinality(&self) -> memvault_core::Result<Vec<memvault_core::Cardinality>> {
        self.inner.cardinality().await
    }
}

#[tokio::test]
async fn cancellation_mid_capture_restarts_write_path() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    // Cancelled while the relational store is dumping, with the write path
    // already stopped.
    let adapters: Vec<Box<dyn StoreAdapter>> = vec![
        Box::new(MockStoreAdapter::new(StoreKind::Vector).with_unit("memories", 10)),
        Box::new(CancellingAdapter {
            inner: MockStoreAdapter::new(StoreKind::Relational).with_unit("mem0", 3),
            cancel: cancel.clone(),
        }),
        Box::new(MockStoreAdapter::new(StoreKind::Graph).with_unit("graph", 5)),
    ];
    let services = Arc::new(StaticServiceControl::with_running(["mem0-api", "mem0-webui"]));
    let coordinator =
        BackupCoordinator::new(test_config(dir.path()), adapters, Box::new(services.clone()))
            .with_poll_policy(short_policy())
            .with_cancellation(cancel);

    let err = coordinator
        .run(&BackupOptions {
            name: Some("aborted".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Cancelled));
    assert_eq!(coordinator.phase(), BackupPhase::Failed);

    // The stopped write-path services came back up before the error surfaced.
    let calls = services.calls();
    assert!(calls.contains(&"stop mem0-api".to_string()));
    assert!(calls.contains(&"start mem0-api".to_string()));
    assert!(services.is_running("mem0-api").await.unwrap());
    assert!(services.is_running("mem0-webui").await.unwrap());

    // No archive landed, and the run lock was released.
    assert!(!dir.path().join("memvault-aborted.tar.gz").exists());
    assert!(RunLock::acquire(dir.path()).is_ok());
}

#[tokio::test]
async fn backup_run_refuses_dry_run_flag() {
    let dir = TempDir::new().unwrap();
    let mocks = seeded_mocks();
    let services = Arc::new(StaticServiceControl::with_running(["mem0-api", "mem0-webui"]));
    let coordinator =
        BackupCoordinator::new(test_config(dir.path()), boxed(&mocks), Box::new(services.clone()))
            .with_poll_policy(short_policy());

    let err = coordinator
        .run(&BackupOptions {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    // Nothing was touched: no service calls, no lock, no archive.
    assert!(services.calls().is_empty());
    assert!(RunLock::acquire(dir.path()).is_ok());
}

#[tokio::test]
async fn restore_dry_run_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let archive_path = run_backup(dir.path()).await;

    let target = empty_mocks();
    let services = StaticServiceControl::new();
    let coordinator = RestoreCoordinator::new(
        test_config(dir.path()),
        boxed(&target),
        Box::new(services),
    )
    .with_poll_policy(short_policy());

    let outcome = coordinator
        .run(
            &archive_path,
            &RestoreOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(outcome.loaded.is_empty());
    assert!(outcome.verification.is_none());
    assert_eq!(target.0.restore_invocations(), 0);
    assert_eq!(target.1.restore_invocations(), 0);
    assert_eq!(target.2.restore_invocations(), 0);
}
