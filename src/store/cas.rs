//! Content-addressed blob storage.
//!
//! Blobs are keyed by the SHA-256 of their bytes and sharded by hash prefix:
//!
//! ```text
//! raw/blobs/
//!   2c/
//!     f2/
//!       2cf24dba5fb0a30e...          # object bytes
//!       2cf24dba5fb0a30e....refs     # decimal reference count
//! ```
//!
//! Writes go through a temp file in `raw/tmp` and become visible only on
//! the no-clobber persist. Reference counts are read-modify-written under
//! an exclusive `fs2` lock on the `.refs` file, which serializes racing
//! writers of the same content across threads and processes.
//!
//! The filesystem work is blocking; the async methods run it on tokio's
//! blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use tracing::{debug, error, warn};

use super::{write_atomic, Persist};
use crate::config::{ShardSpec, StorageLayout};
use crate::domain::BlobHash;
use crate::error::{IntegrityError, Result, VaultError};

const REFS_SUFFIX: &str = ".refs";

/// Outcome of a `put`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub hash: BlobHash,
    pub size: u64,
    /// False when the content was already stored and only its refcount moved
    pub newly_written: bool,
}

/// Aggregate blob statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStats {
    /// Physical objects on disk
    pub blob_count: u64,
    /// Bytes held by those objects
    pub blob_bytes: u64,
    /// Sum of all reference counts
    pub total_references: u64,
}

impl BlobStats {
    /// References per physical object; 1.0 means no deduplication
    pub fn dedup_ratio(&self) -> f64 {
        if self.blob_count == 0 {
            return 1.0;
        }
        self.total_references as f64 / self.blob_count as f64
    }
}

#[derive(Debug)]
struct BlobStoreInner {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
    sharding: ShardSpec,
}

/// Deduplicating, integrity-verified blob store
#[derive(Debug, Clone)]
pub struct BlobStore {
    inner: Arc<BlobStoreInner>,
}

impl BlobStore {
    /// Open a store rooted at the layout's `raw/blobs`, creating directories
    pub fn open(layout: &StorageLayout, sharding: ShardSpec) -> Result<Self> {
        let blobs_dir = layout.blobs_dir();
        let tmp_dir = layout.tmp_dir();
        for dir in [&blobs_dir, &tmp_dir] {
            fs::create_dir_all(dir).map_err(|e| VaultError::storage(dir, e))?;
        }

        Ok(Self {
            inner: Arc::new(BlobStoreInner {
                blobs_dir,
                tmp_dir,
                sharding,
            }),
        })
    }

    /// Canonical path of an object
    pub fn object_path(&self, hash: &BlobHash) -> PathBuf {
        let hex = hash.as_str();
        let ShardSpec { depth, width } = self.inner.sharding;

        let mut path = self.inner.blobs_dir.clone();
        for level in 0..depth {
            path.push(&hex[level * width..(level + 1) * width]);
        }
        path.push(hex);
        path
    }

    fn refs_path(&self, hash: &BlobHash) -> PathBuf {
        let mut path = self.object_path(hash);
        path.set_file_name(format!("{}{}", hash, REFS_SUFFIX));
        path
    }

    // ------------------------------------------------------------------
    // Blocking core
    // ------------------------------------------------------------------

    /// Store bytes, or bump the refcount if identical content exists
    pub fn put_blocking(&self, bytes: &[u8]) -> Result<PutResult> {
        let hash = BlobHash::of(bytes);
        let size = bytes.len() as u64;
        let object_path = self.object_path(&hash);

        if let Some(shard_dir) = object_path.parent() {
            fs::create_dir_all(shard_dir).map_err(|e| VaultError::storage(shard_dir, e))?;
        }

        let mut refs = RefCount::lock(&self.refs_path(&hash))?;

        let newly_written = match fs::metadata(&object_path) {
            Ok(meta) => {
                if meta.len() != size {
                    error!(%hash, existing = meta.len(), incoming = size, "Hash collision");
                    return Err(IntegrityError::Collision {
                        hash: hash.to_string(),
                        existing_size: meta.len(),
                        incoming_size: size,
                    }
                    .into());
                }
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A writer that bypassed the lock may still win the persist;
                // equal hashes mean equal content, so either result is fine.
                write_atomic(&self.inner.tmp_dir, &object_path, bytes, Persist::NoClobber)?
            }
            Err(e) => return Err(VaultError::storage(&object_path, e)),
        };

        let count = refs.read()? + 1;
        refs.write(count)?;

        debug!(%hash, size, newly_written, refs = count, "Stored blob");

        Ok(PutResult {
            hash,
            size,
            newly_written,
        })
    }

    /// Read an object and verify it still hashes to its name
    pub fn get_blocking(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(format!("blob {}", hash)));
            }
            Err(e) => return Err(VaultError::storage(&path, e)),
        };

        let actual = BlobHash::of(&bytes);
        if &actual != hash {
            error!(expected = %hash, %actual, path = %path.display(), "Blob failed verification");
            return Err(IntegrityError::Mismatch {
                expected: hash.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }

        Ok(bytes)
    }

    pub fn exists_blocking(&self, hash: &BlobHash) -> Result<bool> {
        let path = self.object_path(hash);
        path.try_exists().map_err(|e| VaultError::storage(&path, e))
    }

    /// Drop one reference; the object is removed when none remain.
    /// Returns the remaining count. Only the retention path calls this.
    pub fn delete_blocking(&self, hash: &BlobHash) -> Result<u64> {
        let object_path = self.object_path(hash);
        let refs_path = self.refs_path(hash);

        if !object_path.exists() && !refs_path.exists() {
            return Err(VaultError::NotFound(format!("blob {}", hash)));
        }

        let mut refs = RefCount::lock(&refs_path)?;
        let remaining = refs.read()?.saturating_sub(1);
        refs.write(remaining)?;

        if remaining == 0 {
            remove_if_exists(&object_path)?;
            debug!(%hash, "Removed unreferenced blob");
        }

        Ok(remaining)
    }

    /// Current reference count (0 when unknown)
    pub fn refcount_blocking(&self, hash: &BlobHash) -> Result<u64> {
        let refs_path = self.refs_path(hash);
        if !refs_path.exists() {
            return Ok(0);
        }
        RefCount::lock(&refs_path)?.read()
    }

    /// Overwrite the reference count, removing the object at zero.
    /// Used by retention to reconcile counts against manifests.
    pub fn set_refcount_blocking(&self, hash: &BlobHash, count: u64) -> Result<()> {
        let object_path = self.object_path(hash);
        if let Some(shard_dir) = object_path.parent() {
            fs::create_dir_all(shard_dir).map_err(|e| VaultError::storage(shard_dir, e))?;
        }

        let mut refs = RefCount::lock(&self.refs_path(hash))?;
        refs.write(count)?;
        if count == 0 {
            remove_if_exists(&object_path)?;
        }
        Ok(())
    }

    /// Every object hash currently on disk
    pub fn list_blocking(&self) -> Result<Vec<BlobHash>> {
        let mut hashes = Vec::new();
        self.walk(&mut |path, _| {
            if let Some(hash) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| BlobHash::parse(n).ok())
            {
                hashes.push(hash);
            }
        })?;
        hashes.sort();
        Ok(hashes)
    }

    pub fn stats_blocking(&self) -> Result<BlobStats> {
        let mut stats = BlobStats::default();
        let mut objects = Vec::new();

        self.walk(&mut |path, len| {
            if let Some(hash) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| BlobHash::parse(n).ok())
            {
                stats.blob_count += 1;
                stats.blob_bytes += len;
                objects.push(hash);
            }
        })?;

        for hash in &objects {
            stats.total_references += self.refcount_blocking(hash)?;
        }

        Ok(stats)
    }

    /// Remove temp files abandoned by crashed writers
    pub fn sweep_temp_blocking(&self, max_age: Duration) -> Result<usize> {
        let tmp_dir = &self.inner.tmp_dir;
        let entries = match fs::read_dir(tmp_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(VaultError::storage(tmp_dir, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries {
            let entry = entry.map_err(|e| VaultError::storage(tmp_dir, e))?;
            let meta = entry
                .metadata()
                .map_err(|e| VaultError::storage(entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }

            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();

            if age >= max_age {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to sweep temp file"),
                }
            }
        }

        Ok(removed)
    }

    /// Visit every non-refs file under the blob tree
    fn walk(&self, visit: &mut dyn FnMut(&Path, u64)) -> Result<()> {
        let mut stack = vec![self.inner.blobs_dir.clone()];

        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(VaultError::storage(&dir, e)),
            };

            for entry in entries {
                let entry = entry.map_err(|e| VaultError::storage(&dir, e))?;
                let path = entry.path();
                let meta = entry
                    .metadata()
                    .map_err(|e| VaultError::storage(&path, e))?;

                if meta.is_dir() {
                    stack.push(path);
                } else if !path.to_string_lossy().ends_with(REFS_SUFFIX) {
                    visit(&path, meta.len());
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Async API
    // ------------------------------------------------------------------

    /// Hash and store bytes; deduplicates against existing content
    pub async fn put(&self, bytes: Vec<u8>) -> Result<PutResult> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.put_blocking(&bytes)).await?
    }

    /// Verified read
    pub async fn get(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        let store = self.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || store.get_blocking(&hash)).await?
    }

    pub async fn exists(&self, hash: &BlobHash) -> Result<bool> {
        let path = self.object_path(hash);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| VaultError::storage(&path, e))
    }

    pub async fn delete(&self, hash: &BlobHash) -> Result<u64> {
        let store = self.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || store.delete_blocking(&hash)).await?
    }

    pub async fn refcount(&self, hash: &BlobHash) -> Result<u64> {
        let store = self.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || store.refcount_blocking(&hash)).await?
    }

    pub async fn set_refcount(&self, hash: &BlobHash, count: u64) -> Result<()> {
        let store = self.clone();
        let hash = hash.clone();
        tokio::task::spawn_blocking(move || store.set_refcount_blocking(&hash, count)).await?
    }

    pub async fn list(&self) -> Result<Vec<BlobHash>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_blocking()).await?
    }

    pub async fn stats(&self) -> Result<BlobStats> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.stats_blocking()).await?
    }

    pub async fn sweep_temp(&self, max_age: Duration) -> Result<usize> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.sweep_temp_blocking(max_age)).await?
    }

    /// Read-only view handed to processors
    pub fn reader(&self) -> BlobReader {
        BlobReader {
            store: self.clone(),
        }
    }
}

/// Read-only blob access for processing workers
#[derive(Debug, Clone)]
pub struct BlobReader {
    store: BlobStore,
}

impl BlobReader {
    /// Verified read; fails with an integrity error rather than returning
    /// mismatched bytes
    pub fn read(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        self.store.get_blocking(hash)
    }

    /// Verified read decoded as UTF-8, replacing invalid sequences
    pub fn read_text(&self, hash: &BlobHash) -> Result<String> {
        let bytes = self.read(hash)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn exists(&self, hash: &BlobHash) -> Result<bool> {
        self.store.exists_blocking(hash)
    }
}

/// An exclusively locked `.refs` file; the lock is released on drop
struct RefCount {
    file: File,
    path: PathBuf,
}

impl RefCount {
    fn lock(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| VaultError::storage(path, e))?;

        file.lock_exclusive()
            .map_err(|e| VaultError::storage(path, e))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn read(&mut self) -> Result<u64> {
        let mut content = String::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_string(&mut content))
            .map_err(|e| VaultError::storage(&self.path, e))?;

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        trimmed.parse().map_err(|_| {
            VaultError::storage(
                &self.path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Corrupt reference count: {:?}", trimmed),
                ),
            )
        })
    }

    fn write(&mut self, count: u64) -> Result<()> {
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(count.to_string().as_bytes()))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| VaultError::storage(&self.path, e))
    }
}

impl Drop for RefCount {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VaultError::storage(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (BlobStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let store = BlobStore::open(&layout, ShardSpec::default()).unwrap();
        (store, temp)
    }

    #[test]
    fn test_object_path_is_sharded() {
        let (store, temp) = create_test_store();
        let hash = BlobHash::of(b"hello");

        let path = store.object_path(&hash);
        let expected = temp
            .path()
            .join("raw/blobs/2c/f2")
            .join(hash.as_str());
        assert_eq!(path, expected);
    }

    #[test]
    fn test_custom_sharding() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let store = BlobStore::open(&layout, ShardSpec { depth: 1, width: 3 }).unwrap();

        let hash = BlobHash::of(b"hello");
        let path = store.object_path(&hash);
        assert!(path.ends_with(format!("2cf/{}", hash)));
    }

    #[test]
    fn test_put_dedup_and_refcount() {
        let (store, _temp) = create_test_store();

        let first = store.put_blocking(b"hello").unwrap();
        let second = store.put_blocking(b"hello").unwrap();

        assert_eq!(first.hash, second.hash);
        assert!(first.newly_written);
        assert!(!second.newly_written);
        assert_eq!(store.refcount_blocking(&first.hash).unwrap(), 2);

        let stats = store.stats_blocking().unwrap();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.blob_bytes, 5);
        assert_eq!(stats.total_references, 2);
        assert!((stats.dedup_ratio() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_get_verifies_content() {
        let (store, _temp) = create_test_store();
        let put = store.put_blocking(b"original").unwrap();

        assert_eq!(store.get_blocking(&put.hash).unwrap(), b"original");

        // Tamper with the object in place
        std::fs::write(store.object_path(&put.hash), b"tampered").unwrap();

        let err = store.get_blocking(&put.hash).unwrap_err();
        assert!(matches!(
            err,
            VaultError::Integrity(IntegrityError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_size_mismatch_is_collision() {
        let (store, _temp) = create_test_store();
        let put = store.put_blocking(b"abc").unwrap();

        std::fs::write(store.object_path(&put.hash), b"abcdef").unwrap();

        let err = store.put_blocking(b"abc").unwrap_err();
        assert!(matches!(
            err,
            VaultError::Integrity(IntegrityError::Collision { .. })
        ));
        // The existing object was not overwritten
        assert_eq!(std::fs::read(store.object_path(&put.hash)).unwrap(), b"abcdef");
    }

    #[test]
    fn test_delete_removes_at_zero() {
        let (store, _temp) = create_test_store();
        let hash = store.put_blocking(b"x").unwrap().hash;
        store.put_blocking(b"x").unwrap();

        assert_eq!(store.delete_blocking(&hash).unwrap(), 1);
        assert!(store.exists_blocking(&hash).unwrap());

        assert_eq!(store.delete_blocking(&hash).unwrap(), 0);
        assert!(!store.exists_blocking(&hash).unwrap());
        assert!(matches!(
            store.get_blocking(&hash),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_unknown_hash() {
        let (store, _temp) = create_test_store();
        let hash = BlobHash::of(b"never stored");
        assert!(matches!(
            store.delete_blocking(&hash),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_blob() {
        let (store, _temp) = create_test_store();
        let put = store.put_blocking(b"").unwrap();
        assert_eq!(put.size, 0);
        assert!(store.get_blocking(&put.hash).unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_refs_files() {
        let (store, _temp) = create_test_store();
        let a = store.put_blocking(b"a").unwrap().hash;
        let b = store.put_blocking(b"b").unwrap().hash;

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list_blocking().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_concurrent_identical_puts_converge() {
        let (store, _temp) = create_test_store();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put(b"same bytes".to_vec()).await.unwrap()
            }));
        }

        let mut written = 0;
        for handle in handles {
            if handle.await.unwrap().newly_written {
                written += 1;
            }
        }

        let hash = BlobHash::of(b"same bytes");
        assert_eq!(written, 1);
        assert_eq!(store.refcount(&hash).await.unwrap(), 16);
        assert_eq!(store.stats().await.unwrap().blob_count, 1);
    }
}
