//! In-memory store adapter used by coordinator tests and scenario tests.
//!
//! The mock holds per-unit element counts behind an `Arc`, so a test can keep
//! one clone for inspection while handing another to a coordinator. Failure
//! injection covers the cases the coordinators must tolerate: an unreachable
//! store, individual units failing to capture, and a restore blowing up
//! mid-run.

use super::{Cardinality, StoreAdapter};
use crate::metadata::{StoreKind, StoreManifest, UnitRecord};
use crate::{Result, VaultError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct MockState {
    /// unit name -> element count
    units: BTreeMap<String, u64>,
    unreachable: bool,
    capture_fail_units: Vec<String>,
    restore_fail_unit: Option<String>,
    restore_invocations: u32,
}

#[derive(Serialize, Deserialize)]
struct MockDump {
    name: String,
    count: u64,
}

/// Shareable in-memory implementation of [`StoreAdapter`].
#[derive(Debug, Clone)]
pub struct MockStoreAdapter {
    kind: StoreKind,
    state: Arc<Mutex<MockState>>,
}

impl MockStoreAdapter {
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Seed a unit with `count` elements.
    pub fn with_unit<S: Into<String>>(self, name: S, count: u64) -> Self {
        self.state.lock().unwrap().units.insert(name.into(), count);
        self
    }

    /// Make every store call fail as if the service were down.
    pub fn unreachable(self) -> Self {
        self.state.lock().unwrap().unreachable = true;
        self
    }

    /// Make capture of one unit fail while siblings succeed.
    pub fn fail_capture_of<S: Into<String>>(self, unit: S) -> Self {
        self.state
            .lock()
            .unwrap()
            .capture_fail_units
            .push(unit.into());
        self
    }

    /// Make restore of one unit fail.
    pub fn fail_restore_of<S: Into<String>>(self, unit: S) -> Self {
        self.state.lock().unwrap().restore_fail_unit = Some(unit.into());
        self
    }

    /// Drop all content, as if the stack were freshly provisioned.
    pub fn clear(&self) {
        self.state.lock().unwrap().units.clear();
    }

    /// Current element count per unit.
    pub fn unit_counts(&self) -> BTreeMap<String, u64> {
        self.state.lock().unwrap().units.clone()
    }

    /// How many times `restore` has been invoked on this adapter.
    pub fn restore_invocations(&self) -> u32 {
        self.state.lock().unwrap().restore_invocations
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            Err(VaultError::service(format!(
                "{} store unreachable",
                self.kind
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreAdapter for MockStoreAdapter {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn discover(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().units.keys().cloned().collect())
    }

    async fn capture(&self, dest: &Path) -> Result<StoreManifest> {
        self.check_reachable()?;
        fs::create_dir_all(dest)?;
        let state = self.state.lock().unwrap();
        let mut manifest = StoreManifest::new(self.kind);
        for (name, count) in &state.units {
            if state.capture_fail_units.contains(name) {
                manifest.push(UnitRecord::failed(name, "injected capture failure"));
                continue;
            }
            let file_name = format!("{name}.json");
            let dump = MockDump {
                name: name.clone(),
                count: *count,
            };
            fs::write(dest.join(&file_name), serde_json::to_vec(&dump)?)?;
            manifest.push(UnitRecord::captured(
                name,
                vec![format!("{}/{file_name}", self.kind.dir_name())],
            ));
        }
        Ok(manifest)
    }

    async fn restore(&self, src: &Path, manifest: &StoreManifest) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.restore_invocations += 1;
        for unit in manifest.captured_units() {
            if state.restore_fail_unit.as_deref() == Some(unit.name.as_str()) {
                return Err(VaultError::restore(&unit.name, "injected restore failure"));
            }
            let file = unit
                .files
                .first()
                .map(|f| src.join(f))
                .ok_or_else(|| VaultError::restore(&unit.name, "manifest lists no files"))?;
            let dump: MockDump = serde_json::from_slice(&fs::read(file)?)?;
            state.units.insert(dump.name, dump.count);
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        self.check_reachable()?;
        // Units with zero elements count as empty, same as the vector
        // adapter's all-collections-at-zero-points rule.
        let state = self.state.lock().unwrap();
        Ok(state.units.values().all(|&c| c == 0))
    }

    async fn probe(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn cardinality(&self) -> Result<Vec<Cardinality>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .units
            .iter()
            .map(|(name, count)| Cardinality::new(name.clone(), "elements", *count))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_capture_restore_roundtrip() {
        let source = MockStoreAdapter::new(StoreKind::Vector)
            .with_unit("memories", 10)
            .with_unit("scratch", 0);
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("vector");
        let manifest = source.capture(&dest).await.unwrap();
        assert_eq!(manifest.captured_units().count(), 2);

        let target = MockStoreAdapter::new(StoreKind::Vector);
        assert!(target.is_empty().await.unwrap());
        target.restore(dir.path(), &manifest).await.unwrap();
        assert_eq!(target.unit_counts(), source.unit_counts());
    }

    #[tokio::test]
    async fn test_partial_capture_failure_is_soft() {
        let adapter = MockStoreAdapter::new(StoreKind::Vector)
            .with_unit("good", 5)
            .with_unit("bad", 7)
            .fail_capture_of("bad");
        let dir = TempDir::new().unwrap();
        let manifest = adapter.capture(&dir.path().join("vector")).await.unwrap();
        assert_eq!(manifest.captured_units().count(), 1);
        assert_eq!(manifest.failed_units().count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_errors() {
        let adapter = MockStoreAdapter::new(StoreKind::Graph).unreachable();
        assert!(adapter.probe().await.is_err());
        assert!(adapter.discover().await.is_err());
    }
}
