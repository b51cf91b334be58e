//! Mutual exclusion between coordinator runs against the same target stack.
//!
//! Only one backup or restore may run at a time: both stop and start shared
//! services, so overlapping runs would fight over the live service set.

use crate::{Result, VaultError};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the run lock inside the backup directory.
pub const LOCK_FILE: &str = "memvault.lock";

/// Held for the duration of one coordinator run; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the run lock for `dir`, failing fast if another coordinator
    /// already holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                debug!(path = %path.display(), "run lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(VaultError::Locked { path })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}
