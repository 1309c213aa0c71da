//! Vault: the public entry point tying the stores together.
//!
//! A `Vault` owns one storage root. It holds the catalog connection and the
//! processor registry; nothing is process-global. Lookups prefer the
//! catalog and fall back to scanning manifests whenever it is disabled or
//! unavailable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::capture::{CaptureEngine, CaptureOutcome, CaptureSession};
use super::journal::Journal;
use super::pipeline::{ProcessReport, Processor, ProcessingPipeline, ProcessorRegistry};
use super::retention::Retention;
use crate::config::{StorageLayout, VaultConfig};
use crate::domain::{BlobHash, FetchResult, Manifest, ManifestId, RunId, RunSummary};
use crate::error::{Result, VaultError};
use crate::store::{BlobReader, BlobStore, Catalog, ManifestRef, ManifestStore};

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub blob_count: u64,
    pub blob_bytes: u64,
    pub total_references: u64,
    /// References per physical blob
    pub dedup_ratio: f64,
    pub manifest_count: u64,
    pub run_count: u64,
    pub derived_bytes: u64,
}

/// Capture-then-process storage engine over one root
#[derive(Debug)]
pub struct Vault {
    config: VaultConfig,
    layout: StorageLayout,
    blobs: BlobStore,
    manifests: ManifestStore,
    catalog: Option<Catalog>,
    journal: Journal,
    capture: CaptureEngine,
    pipeline: ProcessingPipeline,
    processors: ProcessorRegistry,

    /// Live capture sessions by run, shared by concurrent `capture` calls
    sessions: Mutex<HashMap<RunId, Weak<CaptureSession>>>,
}

impl Vault {
    /// Open (or initialise) the vault at `config.root`.
    ///
    /// An unreadable catalog does not fail the open; the vault runs
    /// degraded until [`Vault::rebuild_catalog`].
    pub fn open(config: VaultConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| VaultError::InvalidInput(format!("{:#}", e)))?;

        let layout = config.layout();
        for dir in layout.required_dirs() {
            std::fs::create_dir_all(&dir).map_err(|e| VaultError::storage(&dir, e))?;
        }

        let blobs = BlobStore::open(&layout, config.sharding)?;
        let manifests = ManifestStore::open(&layout)?;
        let journal = Journal::open(&layout)?;
        let catalog = if config.catalog_enabled {
            let path = layout.catalog_path();
            if !path.exists() && has_manifests(&layout) {
                // A fresh empty catalog would answer every lookup with nothing
                warn!(path = %path.display(), "Catalog missing, lookups will scan manifests until it is rebuilt");
                Some(Catalog::unavailable(&path))
            } else {
                Some(Catalog::open_or_degraded(&path))
            }
        } else {
            None
        };

        let capture = CaptureEngine::new(
            blobs.clone(),
            manifests.clone(),
            catalog.clone(),
            journal.clone(),
            config.concurrency,
        );
        let pipeline = ProcessingPipeline::new(
            &layout,
            manifests.clone(),
            blobs.clone(),
            journal.clone(),
            config.concurrency.processing_workers,
        );

        info!(root = %layout.root().display(), catalog = catalog.is_some(), "Opened vault");

        Ok(Self {
            config,
            layout,
            blobs,
            manifests,
            catalog,
            journal,
            capture,
            pipeline,
            processors: ProcessorRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Register the built-in processors
    pub fn with_builtin_processors(mut self) -> Result<Self> {
        crate::processors::register_builtins(&mut self.processors)?;
        Ok(self)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    pub fn register_processor(&mut self, processor: Arc<dyn Processor>) -> Result<()> {
        self.processors.register(processor)
    }

    /// Register a closure as a processor
    pub fn register_fn<F>(&mut self, name: &str, version: &str, func: F) -> Result<()>
    where
        F: Fn(&Manifest, &BlobReader) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.processors.register_fn(name, version, func)
    }

    /// Whether lookups are served by the catalog
    pub fn catalog_available(&self) -> bool {
        self.catalog.as_ref().is_some_and(|c| c.is_available())
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    /// Capture one fetch result.
    ///
    /// Concurrent calls for the same run share one session, so a duplicate
    /// url waits for the first call and reuses its manifest without storing
    /// anything. Use [`Vault::session`] to also share the fetch itself.
    pub async fn capture(&self, fetch: FetchResult) -> Result<CaptureOutcome> {
        let session = self.shared_session(&fetch.run_id)?;
        session.capture(fetch).await
    }

    fn shared_session(&self, run_id: &RunId) -> Result<Arc<CaptureSession>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| VaultError::Task("session table poisoned".to_string()))?;

        if let Some(session) = sessions.get(run_id).and_then(Weak::upgrade) {
            return Ok(session);
        }

        sessions.retain(|_, session| session.strong_count() > 0);
        let session = Arc::new(self.capture.session(run_id.clone()));
        sessions.insert(run_id.clone(), Arc::downgrade(&session));
        Ok(session)
    }

    pub fn session(&self, run_id: RunId) -> CaptureSession {
        self.capture.session(run_id)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub async fn get_manifest(&self, manifest_id: &ManifestId) -> Result<Manifest> {
        if let Some(ref catalog) = self.catalog {
            match catalog.manifest_path(manifest_id).await {
                Ok(Some(path)) => match self.manifests.load_path(&path).await {
                    Ok(manifest) => return Ok(manifest),
                    Err(VaultError::NotFound(_)) => {
                        warn!(%manifest_id, "Catalog points at a missing manifest");
                    }
                    Err(e) => return Err(e),
                },
                Ok(None) => {}
                Err(VaultError::Catalog(e)) => {
                    warn!(error = %e, "Catalog lookup failed, scanning manifests");
                }
                Err(e) => return Err(e),
            }
        }

        self.manifests
            .find(manifest_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("manifest {}", manifest_id)))
    }

    /// Manifests for a url (optionally within one run), oldest first
    #[instrument(skip(self))]
    pub async fn find_by_url(&self, url: &str, run_id: Option<&RunId>) -> Result<Vec<ManifestRef>> {
        if let Some(ref catalog) = self.catalog {
            match catalog.find_by_url(url, run_id).await {
                Ok(refs) => return Ok(refs),
                Err(VaultError::Catalog(e)) => {
                    warn!(error = %e, "Catalog lookup failed, scanning manifests");
                }
                Err(e) => return Err(e),
            }
        }
        self.manifests.scan_by_url(url, run_id).await
    }

    /// Manifests referencing a blob, oldest first
    #[instrument(skip(self))]
    pub async fn find_by_hash(&self, hash: &BlobHash) -> Result<Vec<ManifestRef>> {
        if let Some(ref catalog) = self.catalog {
            match catalog.find_by_hash(hash).await {
                Ok(refs) => return Ok(refs),
                Err(VaultError::Catalog(e)) => {
                    warn!(error = %e, "Catalog lookup failed, scanning manifests");
                }
                Err(e) => return Err(e),
            }
        }
        self.manifests.scan_by_hash(hash).await
    }

    /// Verified blob read
    pub async fn read_blob(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        self.blobs.get(hash).await
    }

    /// Every run with manifests, sorted
    pub async fn list_runs(&self) -> Result<Vec<RunId>> {
        self.manifests.list_runs().await
    }

    /// Manifests of a run, sorted by url
    pub async fn list_run(&self, run_id: &RunId) -> Result<Vec<Manifest>> {
        self.manifests.list_run(run_id).await
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    /// Run processors matching `patterns` (all when empty) over a run
    pub async fn process_run(&self, run_id: &RunId, patterns: &[String]) -> Result<ProcessReport> {
        self.pipeline
            .process_run(run_id, &self.processors, patterns)
            .await
    }

    /// Re-run processing and compare against the previous output
    pub async fn replay(&self, run_id: &RunId, patterns: &[String]) -> Result<ProcessReport> {
        self.pipeline.replay(run_id, &self.processors, patterns).await
    }

    pub fn derived_path(&self, run_id: &RunId, processor: &str) -> PathBuf {
        self.pipeline.output_path(run_id, processor)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> Result<StorageStats> {
        let blob_stats = self.blobs.stats().await?;
        let manifest_count = self.manifests.count().await?;
        let run_count = self.manifests.list_runs().await?.len() as u64;
        let derived_bytes = dir_size(&self.layout.derived_dir()).await?;

        Ok(StorageStats {
            blob_count: blob_stats.blob_count,
            blob_bytes: blob_stats.blob_bytes,
            total_references: blob_stats.total_references,
            dedup_ratio: blob_stats.dedup_ratio(),
            manifest_count,
            run_count,
            derived_bytes,
        })
    }

    /// Rebuild the catalog from the manifest tree. An unreadable catalog
    /// file is deleted and recreated first.
    #[instrument(skip(self))]
    pub async fn rebuild_catalog(&self) -> Result<usize> {
        let Some(ref catalog) = self.catalog else {
            return Err(VaultError::InvalidInput("catalog is disabled".to_string()));
        };

        if !catalog.is_available() {
            catalog.recreate().await?;
        }

        let manifests = self.manifests.scan_all().await?;
        match catalog.rebuild(manifests.clone()).await {
            Ok(count) => Ok(count),
            Err(VaultError::Catalog(e)) => {
                warn!(error = %e, "Catalog rebuild failed, recreating catalog file");
                catalog.recreate().await?;
                catalog.rebuild(manifests).await
            }
            Err(e) => Err(e),
        }
    }

    /// Outcome counts replayed from the run's journal
    pub async fn run_summary(&self, run_id: &RunId) -> Result<RunSummary> {
        self.journal.summary(run_id).await
    }

    pub fn retention(&self) -> Retention {
        Retention::new(
            &self.layout,
            self.blobs.clone(),
            self.manifests.clone(),
            self.catalog.clone(),
            self.journal.clone(),
        )
    }
}

fn has_manifests(layout: &StorageLayout) -> bool {
    std::fs::read_dir(layout.manifests_dir())
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Total size of regular files under `dir`
async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(VaultError::storage(&dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| VaultError::storage(&dir, e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| VaultError::storage(entry.path(), e))?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }

    Ok(total)
}
