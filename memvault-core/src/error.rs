/*!
Error types for the memvault core engine.

The taxonomy mirrors how failures propagate through the coordinators: capture
errors are soft (recorded in the manifest, siblings continue), restore and
integrity errors are hard (they halt the state machine and trigger its cleanup
path), validation errors fire before any live service is touched.
*/

use memvault_health::HealthTimeout;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the memvault core.
pub type Result<T> = std::result::Result<T, VaultError>;

/// A single checksum verification violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    /// File listed in the checksum map is absent from the archive
    Missing(String),
    /// File present in the archive but absent from the checksum map
    Unexpected(String),
    /// File content does not match its recorded hash
    Mismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

impl std::fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "missing file: {path}"),
            Self::Unexpected(path) => write!(f, "unexpected file: {path}"),
            Self::Mismatch {
                path,
                expected,
                actual,
            } => write!(f, "hash mismatch for {path}: expected {expected}, got {actual}"),
        }
    }
}

/// Archive checksum verification failed.
///
/// Verification is all-or-nothing; this error carries every violation found,
/// never a partial "N of M matched" summary.
#[derive(Error, Debug)]
pub struct IntegrityError {
    pub violations: Vec<IntegrityViolation>,
}

impl std::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "integrity check failed ({} violations):", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  {violation}")?;
        }
        Ok(())
    }
}

/// Errors that can occur during backup, restore and verification runs.
#[derive(Error, Debug)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP errors talking to the vector or graph store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A capture unit failed; soft, normally recorded in the manifest
    #[error("capture of unit '{unit}' failed: {reason}")]
    Capture { unit: String, reason: String },

    /// A restore unit failed; fatal to the adapter and the coordinator run
    #[error("restore of unit '{unit}' failed: {reason}")]
    Restore { unit: String, reason: String },

    /// Archive checksum verification failed; blocks any mutation
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// A service never became reachable within the health gate's timeout
    #[error(transparent)]
    HealthTimeout(#[from] HealthTimeout),

    /// Archive structure, version or pre-mutation guard failure
    #[error("validation error: {0}")]
    Validation(String),

    /// Service-level failure: service control (start/stop/logs) or a store
    /// answering a request with an error
    #[error("service error: {0}")]
    Service(String),

    /// An external dump/restore tool exited non-zero
    #[error("{tool} exited with {status}: {stderr}")]
    Tool {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Another coordinator already holds the run lock for this target
    #[error("another backup or restore is already running (lock file: {path})")]
    Locked { path: PathBuf },

    /// The operator aborted the run; cleanup paths still execute
    #[error("operation cancelled")]
    Cancelled,
}

impl VaultError {
    /// Create a new capture error
    pub fn capture<U: Into<String>, R: Into<String>>(unit: U, reason: R) -> Self {
        Self::Capture {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    /// Create a new restore error
    pub fn restore<U: Into<String>, R: Into<String>>(unit: U, reason: R) -> Self {
        Self::Restore {
            unit: unit.into(),
            reason: reason.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new service error
    pub fn service<S: Into<String>>(msg: S) -> Self {
        Self::Service(msg.into())
    }
}
