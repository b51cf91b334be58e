/*!
Restore coordinator: unpack, validate, gate, load, verify.

The run is an explicit state machine, `Idle → Unpacking → Validating →
AwaitingHealth → Loading → Verifying → Done | RolledBack`. Validation runs
entirely against the unpacked archive, before any live service is touched; the
destructive guard then refuses to overwrite non-empty stores unless the
operator passed `--force`.

Load order is fixed: relational first (the API/UI services depend on its
schema), vector second, graph last because its restore is the most
destructive. Rollback is stop-and-report: services this coordinator started
are stopped and the failing store and unit are named, but loads that already
completed are not undone.
*/

use crate::adapter::{AdapterProbe, StoreAdapter};
use crate::archive;
use crate::config::StackConfig;
use crate::integrity;
use crate::lock::RunLock;
use crate::metadata::{ArchiveMetadata, StoreKind};
use crate::service::ServiceControl;
use crate::verify::{CheckReport, Verifier, VerifyMode, VerifyStatus};
use crate::{Result, VaultError};
use memvault_health::{wait_until_healthy, PollPolicy};
use std::path::Path;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fixed per-store load order.
const LOAD_ORDER: [StoreKind; 3] = [StoreKind::Relational, StoreKind::Vector, StoreKind::Graph];

/// Phases of one restore run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    Unpacking,
    Validating,
    AwaitingHealth,
    Loading,
    Verifying,
    Done,
    RolledBack,
}

/// Operator-facing options for one restore run.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Overwrite non-empty target stores
    pub force: bool,
    /// Stop after validation and report what would be restored
    pub dry_run: bool,
    /// Skip the post-load verifier run
    pub skip_verify: bool,
}

/// What a completed restore did.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub metadata: ArchiveMetadata,
    /// Stores loaded, in load order; empty for a dry run
    pub loaded: Vec<StoreKind>,
    /// Post-load verification report, unless skipped or dry run
    pub verification: Option<CheckReport>,
}

/// Sequences unpacking, validation, per-adapter load and verification.
pub struct RestoreCoordinator {
    config: StackConfig,
    adapters: Vec<Box<dyn StoreAdapter>>,
    services: Box<dyn ServiceControl>,
    policy: PollPolicy,
    cancel: CancellationToken,
    phase: Mutex<RestorePhase>,
}

impl RestoreCoordinator {
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
            phase: Mutex::new(RestorePhase::Idle),
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

    pub fn phase(&self) -> RestorePhase {
        *self.phase.lock().unwrap()
    }

    fn transition(&self, to: RestorePhase) {
        let mut phase = self.phase.lock().unwrap();
        info!(from = ?*phase, to = ?to, "restore phase transition");
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

    /// Run one restore to completion.
    pub async fn run(&self, archive_path: &Path, options: &RestoreOptions) -> Result<RestoreOutcome> {
        let _lock = RunLock::acquire(&self.config.backup_dir)?;

        self.transition(RestorePhase::Unpacking);
        let workdir = tempfile::Builder::new()
            .prefix(".memvault-restore-")
            .tempdir_in(&self.config.backup_dir)?;
        archive::unpack(archive_path, workdir.path())?;

        self.transition(RestorePhase::Validating);
        let metadata = self.validate(workdir.path())?;

        if options.dry_run {
            info!("dry run: validation passed, no store will be touched");
            return Ok(RestoreOutcome {
                metadata,
                loaded: Vec::new(),
                verification: None,
            });
        }

        // Bringing the store services up has to precede the destructive
        // guard: emptiness can only be asserted against a reachable store.
        self.transition(RestorePhase::AwaitingHealth);
        let mut started = Vec::new();
        let prepared = self.prepare_stores(&metadata, &mut started).await;
        let guarded = match prepared {
            Ok(()) => self.destructive_guard(&metadata, options).await,
            Err(e) => Err(e),
        };
        if let Err(e) = guarded {
            self.rollback(&started).await;
            return Err(e);
        }

        self.transition(RestorePhase::Loading);
        if let Err(e) = self.load_stores(workdir.path(), &metadata).await {
            self.rollback(&started).await;
            return Err(e);
        }
        let loaded: Vec<StoreKind> = LOAD_ORDER
            .into_iter()
            .filter(|kind| {
                metadata
                    .store(*kind)
                    .map(|s| s.has_captured())
                    .unwrap_or(false)
            })
            .collect();

        let verification = if options.skip_verify {
            None
        } else {
            self.transition(RestorePhase::Verifying);
            let verifier = Verifier::new(self.config.clone())?;
            let report = verifier.run(&self.adapters, VerifyMode::DataOnly).await;
            if report.status() != VerifyStatus::Pass {
                // Restore success is "data loaded", not "semantically perfect".
                for check in report.failed_checks() {
                    warn!(check = %check.name, "post-restore verification check failed");
                }
            }
            Some(report)
        };

        self.transition(RestorePhase::Done);
        info!(loaded = ?loaded, "restore complete");
        Ok(RestoreOutcome {
            metadata,
            loaded,
            verification,
        })
    }

    /// Structural and integrity validation against the unpacked archive.
    /// Fails before any live service is touched.
    fn validate(&self, workdir: &Path) -> Result<ArchiveMetadata> {
        let metadata = ArchiveMetadata::load(workdir)?;
        metadata.validate()?;

        let checksums = integrity::load_checksum_file(workdir)?;
        // Every captured file must be covered by the checksum map.
        for store in metadata.captured_stores() {
            for file in store.captured_files() {
                if !checksums.contains_key(file) {
                    return Err(VaultError::validation(format!(
                        "manifest file {file} has no checksum entry"
                    )));
                }
            }
        }
        integrity::verify_checksums(workdir, &checksums)?;
        info!(
            archive = %metadata.name,
            created_at = %metadata.created_at,
            source_host = %metadata.source_host,
            "archive validated"
        );
        Ok(metadata)
    }

    /// Start (recording it) and health-gate every store the archive restores.
    async fn prepare_stores(
        &self,
        metadata: &ArchiveMetadata,
        started: &mut Vec<String>,
    ) -> Result<()> {
        for kind in LOAD_ORDER {
            let Some(store) = metadata.store(kind).filter(|s| s.has_captured()) else {
                continue;
            };
            let adapter = self.adapter(kind).ok_or_else(|| {
                VaultError::validation(format!("no adapter configured for {} store", store.kind))
            })?;

            let service = self.service_name(kind);
            if !self.services.is_running(service).await? {
                info!(service, "starting store service");
                self.services.start(service).await?;
                started.push(service.to_string());
            }
            let probe = AdapterProbe::new(service, adapter);
            wait_until_healthy(&probe, self.policy).await?;
        }
        Ok(())
    }

    /// Refuse to overwrite non-empty stores unless `--force` was passed.
    /// Runs before any adapter restore call.
    async fn destructive_guard(
        &self,
        metadata: &ArchiveMetadata,
        options: &RestoreOptions,
    ) -> Result<()> {
        if options.force {
            warn!("--force given, skipping destructive-restore guard");
            return Ok(());
        }
        let mut non_empty = Vec::new();
        for kind in LOAD_ORDER {
            if metadata.store(kind).map(|s| s.has_captured()) != Some(true) {
                continue;
            }
            let adapter = self
                .adapter(kind)
                .ok_or_else(|| VaultError::validation(format!("no adapter for {kind} store")))?;
            if !adapter.is_empty().await? {
                non_empty.push(kind.to_string());
            }
        }
        if non_empty.is_empty() {
            Ok(())
        } else {
            Err(VaultError::validation(format!(
                "target store(s) not empty: {}; pass --force to overwrite",
                non_empty.join(", ")
            )))
        }
    }

    /// Load each captured store in the fixed order.
    async fn load_stores(&self, workdir: &Path, metadata: &ArchiveMetadata) -> Result<()> {
        for kind in LOAD_ORDER {
            self.check_cancelled()?;
            let Some(store) = metadata.store(kind).filter(|s| s.has_captured()) else {
                continue;
            };
            let adapter = self
                .adapter(kind)
                .ok_or_else(|| VaultError::validation(format!("no adapter for {kind} store")))?;
            info!(store = %kind, "loading store");
            adapter.restore(workdir, store).await?;
        }
        Ok(())
    }

    /// Stop-and-report rollback: completed loads stay in place.
    async fn rollback(&self, started: &[String]) {
        self.transition(RestorePhase::RolledBack);
        for service in started {
            info!(service, "stopping service started by this restore");
            if let Err(e) = self.services.stop(service).await {
                warn!(service, error = %e, "failed to stop service during rollback");
            }
        }
    }
}
