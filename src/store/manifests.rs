//! Write-once manifest tree.
//!
//! Manifests are stored as pretty JSON at
//! `raw/manifests/<run_id>/<manifest_id>.json`. The no-clobber persist of
//! that file is the capture commit point: once it exists the URL counts as
//! captured for the run, and nothing ever rewrites it.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use super::catalog::ManifestRef;
use super::{write_atomic, Persist};
use crate::config::StorageLayout;
use crate::domain::{BlobHash, Manifest, ManifestId, RunId};
use crate::error::{Result, VaultError};

/// File-based manifest store
#[derive(Debug, Clone)]
pub struct ManifestStore {
    /// raw/manifests
    base_dir: PathBuf,

    /// raw/tmp (same filesystem, so persist is a rename)
    tmp_dir: PathBuf,
}

impl ManifestStore {
    pub fn open(layout: &StorageLayout) -> Result<Self> {
        let base_dir = layout.manifests_dir();
        let tmp_dir = layout.tmp_dir();
        for dir in [&base_dir, &tmp_dir] {
            std::fs::create_dir_all(dir).map_err(|e| VaultError::storage(dir, e))?;
        }
        Ok(Self { base_dir, tmp_dir })
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.base_dir.join(run_id.as_str())
    }

    pub fn manifest_path(&self, run_id: &RunId, manifest_id: &ManifestId) -> PathBuf {
        self.run_dir(run_id).join(format!("{}.json", manifest_id))
    }

    /// Whether the manifest for (run, id) is committed
    pub async fn exists(&self, run_id: &RunId, manifest_id: &ManifestId) -> Result<bool> {
        let path = self.manifest_path(run_id, manifest_id);
        fs::try_exists(&path)
            .await
            .map_err(|e| VaultError::storage(&path, e))
    }

    /// Commit a manifest. Returns false if one already exists at its path,
    /// in which case the existing file is left untouched.
    pub async fn write(&self, manifest: &Manifest) -> Result<bool> {
        let store = self.clone();
        let manifest = manifest.clone();
        tokio::task::spawn_blocking(move || store.write_blocking(&manifest)).await?
    }

    pub fn write_blocking(&self, manifest: &Manifest) -> Result<bool> {
        let run_dir = self.run_dir(&manifest.run_id);
        std::fs::create_dir_all(&run_dir).map_err(|e| VaultError::storage(&run_dir, e))?;

        let path = self.manifest_path(&manifest.run_id, &manifest.manifest_id);
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.tmp_dir, &path, &json, Persist::NoClobber)
    }

    /// Load a manifest file
    pub async fn load_path(&self, path: &Path) -> Result<Manifest> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound(format!("manifest {}", path.display())));
            }
            Err(e) => return Err(VaultError::storage(path, e)),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    pub async fn load(&self, run_id: &RunId, manifest_id: &ManifestId) -> Result<Manifest> {
        self.load_path(&self.manifest_path(run_id, manifest_id)).await
    }

    /// Locate a manifest by id alone by probing every run directory
    pub async fn find(&self, manifest_id: &ManifestId) -> Result<Option<Manifest>> {
        for run_id in self.list_runs().await? {
            let path = self.manifest_path(&run_id, manifest_id);
            let found = fs::try_exists(&path)
                .await
                .map_err(|e| VaultError::storage(&path, e))?;
            if found {
                return self.load_path(&path).await.map(Some);
            }
        }
        Ok(None)
    }

    /// All run ids with a manifest directory, sorted
    pub async fn list_runs(&self) -> Result<Vec<RunId>> {
        let mut runs = Vec::new();

        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(VaultError::storage(&self.base_dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VaultError::storage(&self.base_dir, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(run_id) = entry.file_name().to_str().and_then(|n| RunId::new(n).ok()) {
                runs.push(run_id);
            }
        }

        runs.sort();
        Ok(runs)
    }

    /// Manifest files of a run with their paths, sorted by url then id.
    /// Unreadable files are skipped with a warning.
    pub async fn list_run_with_paths(&self, run_id: &RunId) -> Result<Vec<(Manifest, PathBuf)>> {
        let run_dir = self.run_dir(run_id);
        let mut manifests = Vec::new();

        let mut entries = match fs::read_dir(&run_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(VaultError::storage(&run_dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VaultError::storage(&run_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_path(&path).await {
                Ok(manifest) => manifests.push((manifest, path)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
            }
        }

        manifests.sort_by(|(a, _), (b, _)| {
            a.url
                .cmp(&b.url)
                .then_with(|| a.manifest_id.cmp(&b.manifest_id))
        });
        Ok(manifests)
    }

    /// Manifests of a run, sorted by url then id
    pub async fn list_run(&self, run_id: &RunId) -> Result<Vec<Manifest>> {
        Ok(self
            .list_run_with_paths(run_id)
            .await?
            .into_iter()
            .map(|(manifest, _)| manifest)
            .collect())
    }

    /// Every manifest in the raw zone with its path
    pub async fn scan_all(&self) -> Result<Vec<(Manifest, PathBuf)>> {
        let mut all = Vec::new();
        for run_id in self.list_runs().await? {
            all.extend(self.list_run_with_paths(&run_id).await?);
        }
        Ok(all)
    }

    /// Number of manifest files across all runs, without parsing them
    pub async fn count(&self) -> Result<u64> {
        let mut count = 0;
        for run_id in self.list_runs().await? {
            let run_dir = self.run_dir(&run_id);
            let mut entries = match fs::read_dir(&run_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(VaultError::storage(&run_dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| VaultError::storage(&run_dir, e))?
            {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Slow-path lookup by url, ordered by capture time
    pub async fn scan_by_url(&self, url: &str, run_id: Option<&RunId>) -> Result<Vec<ManifestRef>> {
        let candidates = match run_id {
            Some(run_id) => self.list_run_with_paths(run_id).await?,
            None => self.scan_all().await?,
        };

        let mut refs: Vec<ManifestRef> = candidates
            .iter()
            .filter(|(m, _)| m.url == url)
            .map(|(m, path)| ManifestRef::from_manifest(m, path))
            .collect();
        ManifestRef::sort(&mut refs);
        Ok(refs)
    }

    /// Slow-path reverse lookup by blob hash, ordered by capture time
    pub async fn scan_by_hash(&self, hash: &BlobHash) -> Result<Vec<ManifestRef>> {
        let mut refs: Vec<ManifestRef> = self
            .scan_all()
            .await?
            .iter()
            .filter(|(m, _)| m.blob_refs().any(|h| h == hash))
            .map(|(m, path)| ManifestRef::from_manifest(m, path))
            .collect();
        ManifestRef::sort(&mut refs);
        Ok(refs)
    }

    /// Delete a run's manifest directory. Retention only.
    pub async fn remove_run(&self, run_id: &RunId) -> Result<()> {
        let run_dir = self.run_dir(run_id);
        match fs::remove_dir_all(&run_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::storage(&run_dir, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MANIFEST_VERSION;
    use chrono::Utc;
    use tempfile::TempDir;

    fn manifest(run: &str, url: &str) -> Manifest {
        let run_id = RunId::new(run).unwrap();
        Manifest {
            version: MANIFEST_VERSION,
            manifest_id: ManifestId::for_capture(&run_id, url),
            url: url.to_string(),
            run_id,
            timestamp: Utc::now(),
            status: Some(200),
            headers: Vec::new(),
            primary_hash: Some(BlobHash::of(url.as_bytes())),
            assets: Vec::new(),
            total_bytes: url.len() as u64,
            fetch_duration_ms: 1,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_write_once() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(&StorageLayout::new(temp.path())).unwrap();

        let first = manifest("r1", "https://a.example/");
        let mut second = first.clone();
        second.status = Some(500);

        assert!(store.write(&first).await.unwrap());
        assert!(!store.write(&second).await.unwrap());

        let loaded = store.load(&first.run_id, &first.manifest_id).await.unwrap();
        assert_eq!(loaded.status, Some(200));
    }

    #[tokio::test]
    async fn test_exists_propagates_io_errors() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(&StorageLayout::new(temp.path())).unwrap();
        let m = manifest("r1", "https://a.example/");

        assert!(!store.exists(&m.run_id, &m.manifest_id).await.unwrap());

        // A file where the run directory should be is not "not captured"
        std::fs::write(store.run_dir(&m.run_id), b"not a directory").unwrap();
        assert!(matches!(
            store.exists(&m.run_id, &m.manifest_id).await,
            Err(VaultError::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_and_find() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(&StorageLayout::new(temp.path())).unwrap();

        let b = manifest("r1", "https://b.example/");
        let a = manifest("r1", "https://a.example/");
        let other_run = manifest("r2", "https://a.example/");
        for m in [&b, &a, &other_run] {
            store.write(m).await.unwrap();
        }

        let run1 = store.list_run(&RunId::new("r1").unwrap()).await.unwrap();
        let urls: Vec<_> = run1.iter().map(|m| m.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example/", "https://b.example/"]);

        assert_eq!(store.list_runs().await.unwrap().len(), 2);
        assert_eq!(store.count().await.unwrap(), 3);

        let found = store.find(&other_run.manifest_id).await.unwrap().unwrap();
        assert_eq!(found.run_id.as_str(), "r2");

        let by_url = store.scan_by_url("https://a.example/", None).await.unwrap();
        assert_eq!(by_url.len(), 2);

        let scoped = store
            .scan_by_url("https://a.example/", Some(&RunId::new("r2").unwrap()))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = ManifestStore::open(&StorageLayout::new(temp.path())).unwrap();
        let m = manifest("r1", "https://a.example/");

        assert!(matches!(
            store.load(&m.run_id, &m.manifest_id).await,
            Err(VaultError::NotFound(_))
        ));
        assert!(store.find(&m.manifest_id).await.unwrap().is_none());
    }
}
