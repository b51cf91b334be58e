/*!
Integrity layer: SHA-256 checksums over every archive payload file.

Checksums cover 100% of the files in the staging tree, `metadata.json`
included; the only exclusion is the checksum file itself. Verification is
all-or-nothing: a missing file, an extra file, or a single mismatch rejects
the archive wholesale.
*/

use crate::error::{IntegrityError, IntegrityViolation};
use crate::{Result, VaultError};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

/// File name of the checksum map inside an archive.
pub const CHECKSUM_FILE: &str = "checksums.json";

/// Compute the SHA-256 hash of one file, lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        VaultError::validation(format!("path {} escapes archive root", path.display()))
    })?;
    // Forward slashes regardless of platform: keys are part of the wire format.
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Walk every file under `root` (except the checksum file itself) and hash it.
///
/// Returns a `BTreeMap` so the serialized form is deterministic.
pub fn compute_checksums(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            VaultError::validation(format!("cannot walk {}: {e}", root.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let key = relative_key(root, entry.path())?;
        if key == CHECKSUM_FILE {
            continue;
        }
        checksums.insert(key, hash_file(entry.path())?);
    }
    Ok(checksums)
}

/// Recompute checksums under `root` and compare against `expected`.
///
/// Collects every violation before failing; never reports a partial match as
/// success.
pub fn verify_checksums(root: &Path, expected: &BTreeMap<String, String>) -> Result<()> {
    let actual = compute_checksums(root)?;
    let mut violations = Vec::new();

    for (path, expected_hash) in expected {
        match actual.get(path) {
            None => violations.push(IntegrityViolation::Missing(path.clone())),
            Some(actual_hash) if actual_hash != expected_hash => {
                violations.push(IntegrityViolation::Mismatch {
                    path: path.clone(),
                    expected: expected_hash.clone(),
                    actual: actual_hash.clone(),
                })
            }
            Some(_) => {}
        }
    }
    for path in actual.keys() {
        if !expected.contains_key(path) {
            violations.push(IntegrityViolation::Unexpected(path.clone()));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(IntegrityError { violations }.into())
    }
}

/// Write the checksum map into `root` as pretty-printed JSON.
pub fn write_checksum_file(root: &Path, checksums: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(checksums)?;
    fs::write(root.join(CHECKSUM_FILE), json)?;
    Ok(())
}

/// Load the checksum map from `root`.
pub fn load_checksum_file(root: &Path) -> Result<BTreeMap<String, String>> {
    let path = root.join(CHECKSUM_FILE);
    if !path.exists() {
        return Err(VaultError::validation(format!(
            "archive is missing {CHECKSUM_FILE}"
        )));
    }
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}
