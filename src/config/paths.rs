//! Canonical on-disk layout of a storage root.
//!
//! Single source of truth - use this instead of joining paths by hand.
//!
//! ```text
//! <root>/
//! ├── raw/
//! │   ├── blobs/ab/cd/<sha256>          # CAS objects (+ <sha256>.refs)
//! │   ├── manifests/<run_id>/<id>.json  # write-once capture records
//! │   └── tmp/                          # in-flight writes
//! ├── derived/<run_id>/<processor>.jsonl
//! └── index/
//!     ├── catalog.sqlite
//!     └── journal/<run_id>.jsonl
//! ```

use std::path::{Path, PathBuf};

/// Resolved directories under one storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// RAW zone root
    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.raw_dir().join("blobs")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.raw_dir().join("manifests")
    }

    /// Staging area for atomic writes; same filesystem as the final paths
    pub fn tmp_dir(&self) -> PathBuf {
        self.raw_dir().join("tmp")
    }

    /// DERIVED zone root
    pub fn derived_dir(&self) -> PathBuf {
        self.root.join("derived")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.index_dir().join("catalog.sqlite")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.index_dir().join("journal")
    }

    /// All directories that must exist before the vault is usable
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.blobs_dir(),
            self.manifests_dir(),
            self.tmp_dir(),
            self.derived_dir(),
            self.journal_dir(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_zones() {
        let layout = StorageLayout::new("/data/vault");

        assert_eq!(layout.blobs_dir(), PathBuf::from("/data/vault/raw/blobs"));
        assert_eq!(
            layout.manifests_dir(),
            PathBuf::from("/data/vault/raw/manifests")
        );
        assert_eq!(layout.derived_dir(), PathBuf::from("/data/vault/derived"));
        assert_eq!(
            layout.catalog_path(),
            PathBuf::from("/data/vault/index/catalog.sqlite")
        );
    }

    #[test]
    fn test_tmp_dir_inside_raw_zone() {
        let layout = StorageLayout::new("/data/vault");
        assert!(layout.tmp_dir().starts_with(layout.raw_dir()));
    }
}
