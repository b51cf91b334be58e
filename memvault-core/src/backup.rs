/*!
Backup coordinator: quiesce, capture, seal, compress.

The run is an explicit state machine, `Idle → Capturing → Sealing →
Compressing → Done | Failed`. Capture order is deliberate: the vector store is
snapshotted live first (its server-side snapshots are already consistent),
then the write-path services — the API and UI, never the data stores — are
stopped to freeze write traffic while the relational and graph stores are
dumped, then the stopped services are restarted. The restart runs on every
exit path, including errors and cancellation.

A store that fails to capture is recorded as failed in the manifest and the
run continues; only a run where zero stores captured becomes `Failed`.
*/

use crate::adapter::{AdapterProbe, StoreAdapter};
use crate::archive::{self, LOGS_DIR};
use crate::config::StackConfig;
use crate::integrity;
use crate::lock::RunLock;
use crate::metadata::{ArchiveMetadata, StoreKind, StoreManifest};
use crate::service::ServiceControl;
use crate::{Result, VaultError};
use chrono::Utc;
use memvault_health::{wait_until_healthy, PollPolicy};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Phases of one backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Idle,
    Capturing,
    Sealing,
    Compressing,
    Done,
    Failed,
}

/// Operator-facing options for one backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Archive name; defaults to a UTC timestamp
    pub name: Option<String>,
    /// Report what would be captured without touching anything
    pub dry_run: bool,
    /// Also capture recent service logs into the archive
    pub include_logs: bool,
}

/// What a completed backup produced.
#[derive(Debug)]
pub struct BackupOutcome {
    pub archive_path: PathBuf,
    pub metadata: ArchiveMetadata,
}

impl BackupOutcome {
    /// True when at least one unit failed to capture.
    pub fn is_degraded(&self) -> bool {
        self.metadata.is_degraded()
    }
}

/// Dry-run report: what a backup would capture.
#[derive(Debug)]
pub struct BackupPlan {
    pub archive_path: PathBuf,
    /// Discovered capture units per store; `Err` text when discovery failed
    pub stores: Vec<(StoreKind, std::result::Result<Vec<String>, String>)>,
}

/// Sequences adapters, the integrity layer and packaging into one archive.
pub struct BackupCoordinator {
    config: StackConfig,
    adapters: Vec<Box<dyn StoreAdapter>>,
    services: Box<dyn ServiceControl>,
    policy: PollPolicy,
    cancel: CancellationToken,
    phase: Mutex<BackupPhase>,
}

impl BackupCoordinator {
    pub fn new(
        config: StackConfig,
        adapters: Vec<Box<dyn StoreAdapter>>,
        services: Box<dyn ServiceControl>,
    ) -> Self {
        Self {
            config,
            adapters,
            services,
            policy: PollPolicy::default(),
            cancel: CancellationToken::new(),
            phase: Mutex::new(BackupPhase::Idle),
        }
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn phase(&self) -> BackupPhase {
        *self.phase.lock().unwrap()
    }

    fn transition(&self, to: BackupPhase) {
        let mut phase = self.phase.lock().unwrap();
        info!(from = ?*phase, to = ?to, "backup phase transition");
        *phase = to;
    }

    fn adapter(&self, kind: StoreKind) -> Option<&dyn StoreAdapter> {
        self.adapters
            .iter()
            .find(|a| a.kind() == kind)
            .map(AsRef::as_ref)
    }

    fn service_name(&self, kind: StoreKind) -> &str {
        match kind {
            StoreKind::Vector => &self.config.services.vector_service,
            StoreKind::Relational => &self.config.services.relational_service,
            StoreKind::Graph => &self.config.services.graph_service,
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report what a backup would capture, without stopping services or
    /// writing anything.
    pub async fn plan(&self, options: &BackupOptions) -> Result<BackupPlan> {
        let name = Self::resolve_name(options);
        let mut stores = Vec::new();
        for adapter in &self.adapters {
            let units = adapter.discover().await.map_err(|e| e.to_string());
            stores.push((adapter.kind(), units));
        }
        Ok(BackupPlan {
            archive_path: self.config.backup_dir.join(archive::archive_file_name(&name)),
            stores,
        })
    }

    /// Run one backup to completion.
    ///
    /// Dry runs never reach this path; they are answered by [`Self::plan`],
    /// which returns a report instead of an archive.
    pub async fn run(&self, options: &BackupOptions) -> Result<BackupOutcome> {
        if options.dry_run {
            return Err(VaultError::validation(
                "dry run requested: use plan() to preview a backup",
            ));
        }
        let _lock = RunLock::acquire(&self.config.backup_dir)?;
        let name = Self::resolve_name(options);

        self.transition(BackupPhase::Capturing);
        // Dropping the TempDir cleans up the partial capture on every early
        // return below.
        let staging = tempfile::Builder::new()
            .prefix(&format!(".memvault-{name}-"))
            .tempdir_in(&self.config.backup_dir)?;
        let mut metadata = ArchiveMetadata::new(&name);

        let capture_result = self
            .capture_phase(staging.path(), &mut metadata, options)
            .await;
        if let Err(e) = capture_result {
            self.transition(BackupPhase::Failed);
            return Err(e);
        }
        if !metadata.has_any_captured() {
            self.transition(BackupPhase::Failed);
            return Err(VaultError::validation(
                "backup failed: no store captured successfully",
            ));
        }

        self.transition(BackupPhase::Sealing);
        metadata.save(staging.path())?;
        let checksums = integrity::compute_checksums(staging.path())?;
        integrity::write_checksum_file(staging.path(), &checksums)?;

        self.transition(BackupPhase::Compressing);
        let archive_path = self.config.backup_dir.join(archive::archive_file_name(&name));
        archive::pack(staging.path(), &archive_path)?;

        self.transition(BackupPhase::Done);
        info!(
            archive = %archive_path.display(),
            degraded = metadata.is_degraded(),
            "backup complete"
        );
        Ok(BackupOutcome {
            archive_path,
            metadata,
        })
    }

    fn resolve_name(options: &BackupOptions) -> String {
        options
            .name
            .clone()
            .unwrap_or_else(|| Utc::now().format("%Y%m%d-%H%M%S").to_string())
    }

    /// Capture all stores into the staging tree. Stops the write path around
    /// the relational/graph capture and guarantees the restart afterwards.
    async fn capture_phase(
        &self,
        staging: &Path,
        metadata: &mut ArchiveMetadata,
        options: &BackupOptions,
    ) -> Result<()> {
        // Vector first, live: its snapshot mechanism is already consistent,
        // and stopping the write path is pointless while it streams.
        self.check_cancelled()?;
        self.capture_store(StoreKind::Vector, staging, metadata).await;

        self.check_cancelled()?;
        let stopped = self.stop_write_path().await?;

        let result = async {
            self.check_cancelled()?;
            self.capture_store(StoreKind::Relational, staging, metadata)
                .await;
            self.check_cancelled()?;
            self.capture_store(StoreKind::Graph, staging, metadata).await;
            if options.include_logs {
                self.capture_logs(staging).await;
            }
            Ok(())
        }
        .await;

        // Services that were stopped come back up on every exit path.
        self.resume_services(&stopped).await;
        result
    }

    /// Capture one store, downgrading any failure to a failed manifest entry.
    async fn capture_store(&self, kind: StoreKind, staging: &Path, metadata: &mut ArchiveMetadata) {
        let Some(adapter) = self.adapter(kind) else {
            debug!(store = %kind, "no adapter configured, skipping");
            return;
        };

        let probe = AdapterProbe::new(self.service_name(kind), adapter);
        if let Err(e) = wait_until_healthy(&probe, self.policy).await {
            warn!(store = %kind, error = %e, "store not reachable, capture skipped");
            metadata.push_store(StoreManifest::all_failed(kind, e.to_string()));
            return;
        }

        match adapter.capture(&staging.join(kind.dir_name())).await {
            Ok(manifest) => {
                info!(
                    store = %kind,
                    captured = manifest.captured_units().count(),
                    failed = manifest.failed_units().count(),
                    "store captured"
                );
                metadata.push_store(manifest);
            }
            Err(e) => {
                warn!(store = %kind, error = %e, "store capture failed");
                metadata.push_store(StoreManifest::all_failed(kind, e.to_string()));
            }
        }
    }

    /// Stop the write-path services, returning those actually stopped. If a
    /// stop fails partway, the already-stopped services are resumed before
    /// the error propagates.
    async fn stop_write_path(&self) -> Result<Vec<String>> {
        let mut stopped = Vec::new();
        for service in &self.config.services.write_path {
            let running = match self.services.is_running(service).await {
                Ok(running) => running,
                Err(e) => {
                    self.resume_services(&stopped).await;
                    return Err(e);
                }
            };
            if !running {
                debug!(service, "write-path service already stopped");
                continue;
            }
            info!(service, "stopping write-path service");
            if let Err(e) = self.services.stop(service).await {
                self.resume_services(&stopped).await;
                return Err(e);
            }
            stopped.push(service.clone());
        }
        Ok(stopped)
    }

    async fn resume_services(&self, stopped: &[String]) {
        for service in stopped {
            info!(service, "restarting write-path service");
            if let Err(e) = self.services.start(service).await {
                // Nothing more this run can do; the operator has to intervene.
                warn!(service, error = %e, "failed to restart service");
            }
        }
    }

    /// Best effort: recent log output per service into `logs/`.
    async fn capture_logs(&self, staging: &Path) {
        let logs_dir = staging.join(LOGS_DIR);
        if let Err(e) = fs::create_dir_all(&logs_dir) {
            warn!(error = %e, "cannot create logs directory");
            return;
        }
        let mut services: Vec<&str> = self
            .config
            .services
            .write_path
            .iter()
            .map(String::as_str)
            .collect();
        services.extend([
            self.config.services.vector_service.as_str(),
            self.config.services.relational_service.as_str(),
            self.config.services.graph_service.as_str(),
        ]);

        for service in services {
            match self.services.logs(service).await {
                Ok(output) => {
                    if let Err(e) = fs::write(logs_dir.join(format!("{service}.log")), output) {
                        warn!(service, error = %e, "cannot write service log");
                    }
                }
                Err(e) => warn!(service, error = %e, "cannot collect service log"),
            }
        }
    }
}
