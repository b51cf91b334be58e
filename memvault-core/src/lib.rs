/*!
# memvault core engine

Backup, restore and verification coordinator for a multi-service memory
stack: a vector store (Qdrant), a relational store (Postgres) and a graph
store (Neo4j), fronted by API/UI services.

The core captures point-in-time state from the three heterogeneous stores,
packages it with integrity metadata into a single compressed archive, and
later replays it against a freshly provisioned stack while tolerating partial
failures, version drift and service start-up races.

## Architecture

- Store adapters implement one contract ([`StoreAdapter`]) three times; each
  knows its store's native export/import primitive.
- The integrity layer checksums every archive payload file; verification is
  all-or-nothing.
- The metadata registry records what was captured, when, from where and under
  which coordinator version.
- The backup and restore coordinators are explicit state machines owning the
  quiesce/capture/resume and validate/gate/load/verify protocols.
- The verifier is stateless and read-only, usable standalone as a health
  dashboard.

Service lifecycle and connection parameters are external collaborators,
consumed through the [`ServiceControl`] trait and [`StackConfig`].
*/

pub mod adapter;
pub mod archive;
pub mod backup;
pub mod config;
pub mod error;
pub mod integrity;
pub mod lock;
pub mod metadata;
pub mod restore;
pub mod service;
pub mod verify;

pub use adapter::{
    AdapterProbe, Cardinality, GraphAdapter, MockStoreAdapter, RelationalAdapter, StoreAdapter,
    VectorAdapter,
};
pub use backup::{BackupCoordinator, BackupOptions, BackupOutcome, BackupPhase, BackupPlan};
pub use config::StackConfig;
pub use error::{IntegrityError, IntegrityViolation, Result, VaultError};
pub use lock::RunLock;
pub use metadata::{ArchiveMetadata, StoreKind, StoreManifest, UnitOutcome, UnitRecord};
pub use restore::{RestoreCoordinator, RestoreOptions, RestoreOutcome, RestorePhase};
pub use service::{ComposeControl, ServiceControl, StaticServiceControl};
pub use verify::{Check, CheckOutcome, CheckReport, Verifier, VerifyMode, VerifyStatus};
