/*!
Archive packaging: the compressed directory tree that is the unit of
transfer between hosts.

Layout (wire format): `metadata.json`, `checksums.json`, one directory per
store kind (`vector/`, `relational/`, `graph/`), optionally `logs/`.
*/

use crate::metadata::{ArchiveMetadata, METADATA_FILE};
use crate::{Result, VaultError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};

/// Directory for service logs captured with `--include-logs`.
pub const LOGS_DIR: &str = "logs";

/// File extension of packed archives.
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Derive the archive file name for a backup name.
pub fn archive_file_name(name: &str) -> String {
    format!("memvault-{name}.{ARCHIVE_EXTENSION}")
}

/// Pack the staging directory into a gzip-compressed tarball at `dest`.
///
/// Entry paths are relative to the staging root so the tree unpacks with the
/// documented top-level layout.
pub fn pack(staging: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all(".", staging)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Unpack an archive produced by [`pack`] into `dest`.
///
/// Rejects entries that would escape the destination directory.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<()> {
    if !archive_path.exists() {
        return Err(VaultError::validation(format!(
            "archive not found: {}",
            archive_path.display()
        )));
    }
    fs::create_dir_all(dest)?;

    let file = fs::File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path: PathBuf = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(VaultError::validation(format!(
                "archive entry escapes destination: {}",
                path.display()
            )));
        }
        entry.unpack(dest.join(&path))?;
    }
    Ok(())
}

/// Read only the metadata record out of a packed archive, without unpacking
/// the payload. Used for listing and inspection.
pub fn read_metadata(archive_path: &Path) -> Result<ArchiveMetadata> {
    let file = fs::File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if path.file_name().and_then(|n| n.to_str()) == Some(METADATA_FILE)
            && path.components().count() <= 2
        {
            return Ok(serde_json::from_reader(entry)?);
        }
    }
    Err(VaultError::validation(format!(
        "archive has no {METADATA_FILE}: {}",
        archive_path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let staging = TempDir::new().unwrap();
        fs::create_dir_all(staging.path().join("vector")).unwrap();
        fs::write(staging.path().join("metadata.json"), b"{}").unwrap();
        fs::write(staging.path().join("vector/memories.snapshot"), b"bytes").unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join(archive_file_name("test"));
        pack(staging.path(), &archive).unwrap();
        assert!(archive.exists());

        let dest = TempDir::new().unwrap();
        unpack(&archive, dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("metadata.json")).unwrap(), b"{}");
        assert_eq!(
            fs::read(dest.path().join("vector/memories.snapshot")).unwrap(),
            b"bytes"
        );
    }

    #[test]
    fn test_unpack_missing_archive_is_validation_error() {
        let dest = TempDir::new().unwrap();
        let err = unpack(Path::new("/nonexistent/a.tar.gz"), dest.path()).unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(archive_file_name("nightly"), "memvault-nightly.tar.gz");
    }

    #[test]
    fn test_read_metadata_from_packed_archive() {
        let staging = TempDir::new().unwrap();
        let metadata = ArchiveMetadata::new("peek");
        metadata.save(staging.path()).unwrap();

        let out = TempDir::new().unwrap();
        let archive = out.path().join(archive_file_name("peek"));
        pack(staging.path(), &archive).unwrap();

        let loaded = read_metadata(&archive).unwrap();
        assert_eq!(loaded, metadata);
    }
}
