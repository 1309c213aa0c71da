//! Raw-zone storage and its derived index.
//!
//! - `cas`: content-addressed blob store with reference counts
//! - `manifests`: write-once manifest tree (the capture write barrier)
//! - `catalog`: rebuildable SQLite index over manifests

pub mod cas;
pub mod catalog;
pub mod manifests;

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Result, VaultError};

pub use cas::{BlobReader, BlobStats, BlobStore, PutResult};
pub use catalog::{Catalog, ManifestRef};
pub use manifests::ManifestStore;

/// How [`write_atomic`] treats an existing file at the final path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Persist {
    /// Leave the existing file untouched and report `false`
    NoClobber,
    /// Atomically replace it
    Replace,
}

/// Write `bytes` to a temp file in `tmp_dir`, fsync, then move it to
/// `final_path`. Readers observe either nothing, the previous file, or the
/// complete new file. Returns whether the file at `final_path` is ours.
pub(crate) fn write_atomic(
    tmp_dir: &Path,
    final_path: &Path,
    bytes: &[u8],
    mode: Persist,
) -> Result<bool> {
    let mut tmp =
        NamedTempFile::new_in(tmp_dir).map_err(|e| VaultError::storage(tmp_dir, e))?;
    tmp.write_all(bytes)
        .map_err(|e| VaultError::storage(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| VaultError::storage(tmp.path(), e))?;

    let persisted = match mode {
        Persist::NoClobber => match tmp.persist_noclobber(final_path) {
            Ok(_) => true,
            // Temp file is removed when the returned handle drops
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) => return Err(VaultError::storage(final_path, e.error)),
        },
        Persist::Replace => {
            tmp.persist(final_path)
                .map_err(|e| VaultError::storage(final_path, e.error))?;
            true
        }
    };

    if persisted {
        if let Some(parent) = final_path.parent() {
            sync_dir(parent);
        }
    }

    Ok(persisted)
}

/// Best-effort fsync of a directory so a rename survives power loss
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_no_clobber_keeps_first() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("object");

        assert!(write_atomic(temp.path(), &target, b"first", Persist::NoClobber).unwrap());
        assert!(!write_atomic(temp.path(), &target, b"second", Persist::NoClobber).unwrap());

        assert_eq!(std::fs::read(&target).unwrap(), b"first");
        // Only the target remains; the losing temp file was cleaned up
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_replace() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.jsonl");

        write_atomic(temp.path(), &target, b"old\n", Persist::Replace).unwrap();
        write_atomic(temp.path(), &target, b"new\n", Persist::Replace).unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new\n");
    }
}
