//! Retention: the only code path that removes data from the raw zone.
//!
//! Capture only releases its own uncommitted references. Retention drops
//! whole runs, repairs reference counts left inconsistent by crashed
//! captures, and sweeps temp files abandoned by crashed writers. Run it
//! while no capture is in flight: a blob stored by an uncommitted capture
//! has no manifest yet and would be reconciled away.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::journal::Journal;
use crate::config::StorageLayout;
use crate::domain::{BlobHash, RunId};
use crate::error::{Result, VaultError};
use crate::store::{BlobStore, Catalog, ManifestStore};

/// Result of dropping a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropReport {
    pub manifests_removed: usize,
    /// References released across all blobs
    pub references_released: u64,
    /// Blobs physically removed because no reference remained
    pub blobs_removed: usize,
    /// References to blobs that were already gone
    pub missing_blobs: usize,
}

/// Result of recomputing reference counts from manifests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub blobs_checked: usize,
    pub refcounts_fixed: usize,
    pub blobs_removed: usize,
    /// Referenced by a manifest but absent from the store
    pub missing: Vec<BlobHash>,
}

#[derive(Debug, Clone)]
pub struct Retention {
    blobs: BlobStore,
    manifests: ManifestStore,
    catalog: Option<Catalog>,
    journal: Journal,
    derived_dir: PathBuf,
}

impl Retention {
    pub fn new(
        layout: &StorageLayout,
        blobs: BlobStore,
        manifests: ManifestStore,
        catalog: Option<Catalog>,
        journal: Journal,
    ) -> Self {
        Self {
            blobs,
            manifests,
            catalog,
            journal,
            derived_dir: layout.derived_dir(),
        }
    }

    /// Delete a run: manifests first, then blob references, then derived
    /// output, journal and catalog rows. A crash part way leaves counts too
    /// high, never too low; [`Retention::reconcile`] repairs them.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn drop_run(&self, run_id: &RunId) -> Result<DropReport> {
        let manifests = self.manifests.list_run(run_id).await?;
        if manifests.is_empty() && !self.run_exists(run_id).await? {
            return Err(VaultError::NotFound(format!("run {}", run_id)));
        }

        let hashes: Vec<BlobHash> = manifests
            .iter()
            .flat_map(|m| m.blob_refs().cloned())
            .collect();

        self.manifests.remove_run(run_id).await?;

        let mut report = DropReport {
            manifests_removed: manifests.len(),
            ..DropReport::default()
        };

        for hash in &hashes {
            match self.blobs.delete(hash).await {
                Ok(remaining) => {
                    report.references_released += 1;
                    if remaining == 0 {
                        report.blobs_removed += 1;
                    }
                }
                Err(VaultError::NotFound(_)) => {
                    warn!(%hash, "Referenced blob already missing");
                    report.missing_blobs += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let derived = self.derived_dir.join(run_id.as_str());
        match tokio::fs::remove_dir_all(&derived).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VaultError::storage(&derived, e)),
        }

        self.journal.remove(run_id).await?;

        if let Some(ref catalog) = self.catalog {
            if let Err(e) = catalog.remove_run(run_id).await {
                warn!(error = %e, "Failed to remove catalog rows; rebuild the catalog");
                catalog.mark_stale();
            }
        }

        info!(
            manifests = report.manifests_removed,
            released = report.references_released,
            removed = report.blobs_removed,
            "Dropped run"
        );
        Ok(report)
    }

    async fn run_exists(&self, run_id: &RunId) -> Result<bool> {
        let dir = self.manifests.run_dir(run_id);
        tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| VaultError::storage(&dir, e))
    }

    /// Recompute every blob's reference count from the manifests on disk,
    /// removing blobs nothing references
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut expected: BTreeMap<BlobHash, u64> = BTreeMap::new();
        for (manifest, _) in self.manifests.scan_all().await? {
            for hash in manifest.blob_refs() {
                *expected.entry(hash.clone()).or_insert(0) += 1;
            }
        }

        let mut report = ReconcileReport::default();

        for hash in self.blobs.list().await? {
            report.blobs_checked += 1;
            let want = expected.get(&hash).copied().unwrap_or(0);
            let have = self.blobs.refcount(&hash).await?;
            if have != want {
                self.blobs.set_refcount(&hash, want).await?;
                report.refcounts_fixed += 1;
                if want == 0 {
                    report.blobs_removed += 1;
                }
            }
        }

        for (hash, count) in &expected {
            if !self.blobs.exists(hash).await? {
                warn!(%hash, references = count, "Manifest references a missing blob");
                report.missing.push(hash.clone());
            }
        }

        info!(
            checked = report.blobs_checked,
            fixed = report.refcounts_fixed,
            removed = report.blobs_removed,
            missing = report.missing.len(),
            "Reconciled reference counts"
        );
        Ok(report)
    }

    /// Remove CAS temp files older than `max_age`
    pub async fn sweep_temp(&self, max_age: Duration) -> Result<usize> {
        let removed = self.blobs.sweep_temp(max_age).await?;
        info!(removed, "Swept temp files");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardSpec;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reconcile_removes_orphans() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let blobs = BlobStore::open(&layout, ShardSpec::default()).unwrap();
        let retention = Retention::new(
            &layout,
            blobs.clone(),
            ManifestStore::open(&layout).unwrap(),
            None,
            Journal::open(&layout).unwrap(),
        );

        // A blob stored by a capture that never committed
        let orphan = blobs.put(b"orphan".to_vec()).await.unwrap().hash;

        let report = retention.reconcile().await.unwrap();
        assert_eq!(report.blobs_checked, 1);
        assert_eq!(report.blobs_removed, 1);
        assert!(!blobs.exists(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_unknown_run() {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let retention = Retention::new(
            &layout,
            BlobStore::open(&layout, ShardSpec::default()).unwrap(),
            ManifestStore::open(&layout).unwrap(),
            None,
            Journal::open(&layout).unwrap(),
        );

        assert!(matches!(
            retention.drop_run(&RunId::new("nope").unwrap()).await,
            Err(VaultError::NotFound(_))
        ));
    }
}
