//! Durable file-system helpers.
//!
//! Rewritten segment versions, index files and bloom filters are produced in
//! a temporary file and then promoted with [`promote`], so a reader either
//! sees the complete new file or nothing at all.

use crate::error::StorageResult;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Fsyncs a directory so renames and removals inside it are durable.
///
/// A no-op on platforms where directories cannot be opened as files.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be synced.
pub fn sync_dir(dir: &Path) -> StorageResult<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Renames `temp` over `target` and syncs the parent directory.
///
/// The caller must have synced `temp` first.
///
/// # Errors
///
/// Returns an error if the rename or the directory sync fails.
pub fn promote(temp: &Path, target: &Path) -> StorageResult<()> {
    fs::rename(temp, target)?;
    if let Some(parent) = target.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Writes `bytes` to `temp`, syncs it, and promotes it to `target`.
///
/// # Errors
///
/// Returns an error if any step fails. A leftover `temp` is removed on a
/// best-effort basis.
pub fn write_durable(temp: &Path, target: &Path, bytes: &[u8]) -> StorageResult<()> {
    let written = (|| -> StorageResult<()> {
        let mut file = File::create(temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(temp);
        return Err(err);
    }
    promote(temp, target)
}

/// Removes a file, returning whether it existed.
///
/// # Errors
///
/// Returns an error for any failure other than the file being absent.
pub fn remove_if_exists(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_durable_replaces_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("index");
        let temp = dir.path().join("index.tmp");
        fs::write(&target, b"old").unwrap();

        write_durable(&temp, &target, b"new").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!temp.exists());
    }

    #[test]
    fn remove_if_exists_reports_presence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bloom");
        fs::write(&path, b"x").unwrap();

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
