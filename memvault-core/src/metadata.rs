/*!
Archive metadata: what was captured, when, from where, and by which
coordinator version.

The metadata file is written exactly once while the backup coordinator is
sealing the staging directory and is never mutated afterwards. At restore time
it is the single source of truth for what the archive contains.
*/

use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Current archive format version for cross-version compatibility checks.
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// File name of the metadata document inside an archive.
pub const METADATA_FILE: &str = "metadata.json";

/// The three heterogeneous stores the coordinators address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Vector,
    Relational,
    Graph,
}

impl StoreKind {
    /// Directory name this store's artifacts live under inside an archive.
    /// Part of the wire format; must stay stable across versions.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Relational => "relational",
            Self::Graph => "graph",
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Outcome of one capture unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Captured,
    Failed { reason: String },
}

/// One capture unit: a vector collection, a logical database dump, the roles
/// dump, or the full graph export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Unit name (collection name, database name, "roles", "graph")
    pub name: String,
    /// Files this unit produced, relative to the archive root
    pub files: Vec<String>,
    pub outcome: UnitOutcome,
}

impl UnitRecord {
    pub fn captured<S: Into<String>>(name: S, files: Vec<String>) -> Self {
        Self {
            name: name.into(),
            files,
            outcome: UnitOutcome::Captured,
        }
    }

    pub fn failed<S: Into<String>, R: Into<String>>(name: S, reason: R) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
            outcome: UnitOutcome::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn is_captured(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Captured)
    }
}

/// Per-store manifest: which units were attempted and how they fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub kind: StoreKind,
    pub units: Vec<UnitRecord>,
}

impl StoreManifest {
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            units: Vec::new(),
        }
    }

    /// Manifest for a store that failed wholesale (e.g. unreachable): every
    /// discovered unit recorded as failed, or a single synthetic entry when
    /// discovery itself failed.
    pub fn all_failed<R: Into<String>>(kind: StoreKind, reason: R) -> Self {
        Self {
            kind,
            units: vec![UnitRecord::failed(kind.dir_name(), reason)],
        }
    }

    pub fn push(&mut self, unit: UnitRecord) {
        self.units.push(unit);
    }

    pub fn captured_units(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(|u| u.is_captured())
    }

    pub fn failed_units(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(|u| !u.is_captured())
    }

    /// True when at least one unit captured successfully.
    pub fn has_captured(&self) -> bool {
        self.units.iter().any(|u| u.is_captured())
    }

    /// Every file referenced by a captured unit, relative to the archive root.
    pub fn captured_files(&self) -> impl Iterator<Item = &str> {
        self.captured_units()
            .flat_map(|u| u.files.iter().map(String::as_str))
    }
}

/// Top-level archive metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub format_version: u32,
    /// Unique identifier for this specific archive
    pub archive_id: String,
    /// Operator-chosen or timestamp-derived archive name
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Hostname of the machine the capture ran on
    pub source_host: String,
    /// Version of the coordinator that produced the archive
    pub coordinator_version: String,
    pub stores: Vec<StoreManifest>,
}

impl ArchiveMetadata {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let source_host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            format_version: ARCHIVE_FORMAT_VERSION,
            archive_id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: Utc::now(),
            source_host,
            coordinator_version: env!("CARGO_PKG_VERSION").to_string(),
            stores: Vec::new(),
        }
    }

    pub fn push_store(&mut self, manifest: StoreManifest) {
        self.stores.push(manifest);
    }

    pub fn store(&self, kind: StoreKind) -> Option<&StoreManifest> {
        self.stores.iter().find(|s| s.kind == kind)
    }

    /// Stores with at least one captured unit.
    pub fn captured_stores(&self) -> impl Iterator<Item = &StoreManifest> {
        self.stores.iter().filter(|s| s.has_captured())
    }

    /// True when at least one store captured successfully.
    pub fn has_any_captured(&self) -> bool {
        self.stores.iter().any(|s| s.has_captured())
    }

    /// True when the archive is usable but at least one unit failed.
    pub fn is_degraded(&self) -> bool {
        self.has_any_captured() && self.stores.iter().any(|s| s.failed_units().next().is_some())
    }

    /// Check the archive was produced by a coordinator we can read.
    pub fn is_compatible(&self) -> bool {
        self.format_version <= ARCHIVE_FORMAT_VERSION
    }

    /// Structural validity: used during restore validation.
    pub fn validate(&self) -> Result<()> {
        if !self.is_compatible() {
            return Err(VaultError::validation(format!(
                "incompatible archive format version {} (supported: <= {})",
                self.format_version, ARCHIVE_FORMAT_VERSION
            )));
        }
        if !self.has_any_captured() {
            return Err(VaultError::validation(
                "archive contains no successfully captured store",
            ));
        }
        Ok(())
    }

    /// Write the metadata document into `root` as pretty-printed JSON.
    pub fn save(&self, root: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(root.join(METADATA_FILE), json)?;
        Ok(())
    }

    /// Load the metadata document from `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(METADATA_FILE);
        if !path.exists() {
            return Err(VaultError::validation(format!(
                "archive is missing {METADATA_FILE}"
            )));
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_metadata() -> ArchiveMetadata {
        let mut metadata = ArchiveMetadata::new("nightly");
        let mut vector = StoreManifest::new(StoreKind::Vector);
        vector.push(UnitRecord::captured(
            "memories",
            vec!["vector/memories.snapshot".to_string()],
        ));
        vector.push(UnitRecord::failed("scratch", "server unreachable"));
        metadata.push_store(vector);

        let mut relational = StoreManifest::new(StoreKind::Relational);
        relational.push(UnitRecord::captured(
            "mem0",
            vec!["relational/mem0.sql".to_string()],
        ));
        metadata.push_store(relational);
        metadata
    }

    #[test]
    fn test_metadata_creation() {
        let metadata = ArchiveMetadata::new("nightly");
        assert_eq!(metadata.format_version, ARCHIVE_FORMAT_VERSION);
        assert_eq!(metadata.name, "nightly");
        assert!(!metadata.archive_id.is_empty());
        assert!(!metadata.coordinator_version.is_empty());
    }

    #[test]
    fn test_degraded_detection() {
        let metadata = sample_metadata();
        assert!(metadata.has_any_captured());
        assert!(metadata.is_degraded());

        let empty = ArchiveMetadata::new("empty");
        assert!(!empty.has_any_captured());
        assert!(!empty.is_degraded());
    }

    #[test]
    fn test_captured_files_skips_failed_units() {
        let metadata = sample_metadata();
        let vector = metadata.store(StoreKind::Vector).unwrap();
        let files: Vec<&str> = vector.captured_files().collect();
        assert_eq!(files, vec!["vector/memories.snapshot"]);
    }

    #[test]
    fn test_validate_rejects_empty_archive() {
        let metadata = ArchiveMetadata::new("empty");
        assert!(metadata.validate().is_err());
        assert!(sample_metadata().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_future_version() {
        let mut metadata = sample_metadata();
        metadata.format_version = ARCHIVE_FORMAT_VERSION + 1;
        assert!(!metadata.is_compatible());
        assert!(metadata.validate().is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let metadata = sample_metadata();
        metadata.save(dir.path()).unwrap();

        let loaded = ArchiveMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded, metadata);
    }

    #[test]
    fn test_load_missing_file_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let err = ArchiveMetadata::load(dir.path()).unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
    }

    #[test]
    fn test_store_kind_dir_names_are_wire_format() {
        assert_eq!(StoreKind::Vector.dir_name(), "vector");
        assert_eq!(StoreKind::Relational.dir_name(), "relational");
        assert_eq!(StoreKind::Graph.dir_name(), "graph");
    }
}
