/*!
Store adapters: one contract, three implementations.

Each adapter encapsulates how to extract a consistent point-in-time export
from one store and how to replay it into a freshly provisioned one. The set of
capture units is discovered at capture time, never hard-coded.
*/

use crate::metadata::{StoreKind, StoreManifest};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod graph;
pub mod mock;
pub mod relational;
pub mod vector;

pub use graph::GraphAdapter;
pub use mock::MockStoreAdapter;
pub use relational::RelationalAdapter;
pub use vector::VectorAdapter;

/// One count reported by an adapter: points in a collection, tables in a
/// database, nodes in a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cardinality {
    pub unit: String,
    pub what: String,
    pub count: u64,
}

impl Cardinality {
    pub fn new<U: Into<String>, W: Into<String>>(unit: U, what: W, count: u64) -> Self {
        Self {
            unit: unit.into(),
            what: what.into(),
            count,
        }
    }
}

/// Adapts a store adapter's liveness probe to the health gate's contract.
pub struct AdapterProbe<'a> {
    service: String,
    adapter: &'a dyn StoreAdapter,
}

impl<'a> AdapterProbe<'a> {
    pub fn new<S: Into<String>>(service: S, adapter: &'a dyn StoreAdapter) -> Self {
        Self {
            service: service.into(),
            adapter,
        }
    }
}

#[async_trait]
impl memvault_health::HealthProbe for AdapterProbe<'_> {
    fn service(&self) -> &str {
        &self.service
    }

    async fn check(&self) -> std::result::Result<(), memvault_health::ProbeFailure> {
        self.adapter
            .probe()
            .await
            .map_err(|e| memvault_health::ProbeFailure::new(e.to_string()))
    }
}

/// Capture and restore contract for one store.
///
/// `capture` must not mutate the store. Per-unit capture failures are recorded
/// in the returned manifest and do not abort sibling units; an `Err` means the
/// store failed wholesale (e.g. its unit list could not even be enumerated).
/// Any failure inside `restore` is fatal to the adapter and reported with the
/// failing unit's name.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Enumerate the capture units currently present in the store.
    async fn discover(&self) -> Result<Vec<String>>;

    /// Export every discovered unit into `dest` (the store's directory inside
    /// the staging tree). File paths in the manifest are relative to the
    /// archive root.
    async fn capture(&self, dest: &Path) -> Result<StoreManifest>;

    /// Replay captured units from `src` (the unpacked archive root) into a
    /// running, healthy store. Safe against an empty store; destructive once
    /// invoked — the coordinator owns the confirmation gate, not the adapter.
    async fn restore(&self, src: &Path, manifest: &StoreManifest) -> Result<()>;

    /// Whether the store currently holds no content. Consulted by the restore
    /// coordinator's destructive guard before any restore call.
    async fn is_empty(&self) -> Result<bool>;

    /// Read-only liveness probe, also used by the health gate.
    async fn probe(&self) -> Result<()>;

    /// Read-only cardinality counts for the verifier.
    async fn cardinality(&self) -> Result<Vec<Cardinality>>;
}
