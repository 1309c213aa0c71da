//! Capture engine: phase one of capture-then-process.
//!
//! A capture stores the primary body and every asset in the CAS, then
//! commits a manifest. The manifest persist is the write barrier: a capture
//! returns only after it, and nothing before it is visible as "captured".
//!
//! Single-touch holds at two levels. Inside a [`CaptureSession`] a lock table
//! keyed by url lets exactly one caller fetch and store; the rest wait for
//! its manifest id. Across sessions and processes the deterministic manifest
//! path does the same job: an existing file means the url is taken.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::journal::Journal;
use crate::config::ConcurrencyLimits;
use crate::domain::{
    AssetEntry, BlobHash, FetchResult, FetchedAsset, JournalEvent, JournalEventType, Manifest,
    ManifestId, RunId, RunSummary, MANIFEST_VERSION,
};
use crate::error::{Result, VaultError};
use crate::store::{BlobStore, Catalog, ManifestStore, PutResult};

/// How a capture call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Manifest committed for a successful fetch
    Committed,
    /// Manifest committed recording a failed fetch
    Failed,
    /// The url was already captured in this run; nothing was written
    Duplicate,
}

/// Result of one capture call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOutcome {
    pub manifest_id: ManifestId,
    pub run_id: RunId,
    pub url: String,
    pub kind: CaptureKind,
    /// Whether the catalog accepted the manifest (false in degraded mode)
    pub catalogued: bool,
}

impl CaptureOutcome {
    fn duplicate(run_id: RunId, url: String, manifest_id: ManifestId) -> Self {
        Self {
            manifest_id,
            run_id,
            url,
            kind: CaptureKind::Duplicate,
            catalogued: false,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.kind == CaptureKind::Duplicate
    }
}

/// Stores fetch results and commits manifests
#[derive(Debug, Clone)]
pub struct CaptureEngine {
    blobs: BlobStore,
    manifests: ManifestStore,
    catalog: Option<Catalog>,
    journal: Journal,
    limits: ConcurrencyLimits,

    /// Global asset fan-out bound shared by every capture on this engine
    fanout: Arc<Semaphore>,

    /// Per-origin bounds, created on first use
    origins: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl CaptureEngine {
    pub fn new(
        blobs: BlobStore,
        manifests: ManifestStore,
        catalog: Option<Catalog>,
        journal: Journal,
        limits: ConcurrencyLimits,
    ) -> Self {
        Self {
            blobs,
            manifests,
            catalog,
            journal,
            fanout: Arc::new(Semaphore::new(limits.max_asset_fanout)),
            origins: Arc::new(Mutex::new(HashMap::new())),
            limits,
        }
    }

    /// Start a session that enforces single-touch per url for one run
    pub fn session(&self, run_id: RunId) -> CaptureSession {
        CaptureSession::new(self.clone(), run_id)
    }

    /// Capture one fetch result.
    ///
    /// Fetch failures still commit a manifest. Only local storage failures
    /// are returned as errors, and then no manifest exists.
    #[instrument(skip(self, fetch), fields(run_id = %fetch.run_id, url = %fetch.url))]
    pub async fn capture(&self, fetch: FetchResult) -> Result<CaptureOutcome> {
        let run_id = fetch.run_id.clone();
        let url = fetch.url.clone();
        let start = Instant::now();

        match self.store_and_commit(fetch).await {
            Ok(outcome) => {
                let event_type = match outcome.kind {
                    CaptureKind::Committed => JournalEventType::CaptureCommitted,
                    CaptureKind::Failed => JournalEventType::CaptureFailed,
                    CaptureKind::Duplicate => JournalEventType::CaptureDuplicate,
                };
                let event = JournalEvent::new(
                    run_id,
                    event_type,
                    &url,
                    format!("Capture {:?}", outcome.kind).to_lowercase(),
                )
                .with_manifest(outcome.manifest_id.clone())
                .with_duration(start.elapsed().as_millis() as u64);
                self.journal_best_effort(&event).await;

                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "Capture aborted");
                let event = JournalEvent::new(
                    run_id,
                    JournalEventType::CaptureAborted,
                    &url,
                    "Capture aborted",
                )
                .with_duration(start.elapsed().as_millis() as u64)
                .with_error(e.to_string());
                self.journal_best_effort(&event).await;

                Err(e)
            }
        }
    }

    async fn store_and_commit(&self, fetch: FetchResult) -> Result<CaptureOutcome> {
        let FetchResult {
            url,
            run_id,
            status,
            headers,
            body,
            assets,
            fetch_duration_ms,
            failure,
        } = fetch;

        if url.is_empty() {
            return Err(VaultError::InvalidInput("empty url".to_string()));
        }

        let manifest_id = ManifestId::for_capture(&run_id, &url);

        if self.manifests.exists(&run_id, &manifest_id).await? {
            debug!(%manifest_id, "Manifest already committed");
            return Ok(CaptureOutcome::duplicate(run_id, url, manifest_id));
        }

        let pending = PendingRefs::new(self.blobs.clone());

        let attempt = async {
            let primary = match body {
                Some(bytes) => Some(pending.put(bytes).await?),
                None => None,
            };
            let asset_entries = self.store_assets(&pending, assets).await?;

            let total_bytes = primary.as_ref().map(|p| p.size).unwrap_or(0)
                + asset_entries.iter().map(|a| a.byte_size).sum::<u64>();

            let manifest = Manifest {
                version: MANIFEST_VERSION,
                manifest_id: manifest_id.clone(),
                url: url.clone(),
                run_id: run_id.clone(),
                timestamp: Utc::now(),
                status,
                headers,
                primary_hash: primary.map(|p| p.hash),
                assets: asset_entries,
                total_bytes,
                fetch_duration_ms,
                failure,
            };

            let committed = self.commit_manifest(&pending, &manifest).await?;
            Ok::<_, VaultError>((manifest, committed))
        };

        let (manifest, committed) = match attempt.await {
            Ok(done) => done,
            Err(e) => {
                pending.release().await;
                return Err(e);
            }
        };

        if !committed {
            // Another writer got the manifest path first
            info!(%manifest_id, "Lost commit race, releasing blob references");
            pending.release().await;
            return Ok(CaptureOutcome::duplicate(run_id, url, manifest_id));
        }

        let catalogued = self.register(&manifest).await;

        let kind = if manifest.is_success() {
            CaptureKind::Committed
        } else {
            CaptureKind::Failed
        };

        info!(
            %manifest_id,
            status = ?manifest.status,
            assets = manifest.assets.len(),
            total_bytes = manifest.total_bytes,
            "Committed manifest"
        );

        Ok(CaptureOutcome {
            manifest_id,
            run_id,
            url,
            kind,
            catalogued,
        })
    }

    /// Persist the manifest and mark the pending references committed in
    /// the same blocking call, so a cancelled caller cannot separate them
    async fn commit_manifest(&self, pending: &Arc<PendingRefs>, manifest: &Manifest) -> Result<bool> {
        let manifests = self.manifests.clone();
        let pending = Arc::clone(pending);
        let manifest = manifest.clone();

        tokio::task::spawn_blocking(move || {
            let committed = manifests.write_blocking(&manifest)?;
            if committed {
                pending.commit();
            }
            Ok::<_, VaultError>(committed)
        })
        .await?
    }

    /// Store assets concurrently under the global and per-origin bounds.
    /// Entries come back in input order.
    async fn store_assets(
        &self,
        pending: &Arc<PendingRefs>,
        assets: Vec<FetchedAsset>,
    ) -> Result<Vec<AssetEntry>> {
        if assets.is_empty() {
            return Ok(Vec::new());
        }

        let count = assets.len();
        let mut set = JoinSet::new();

        for (index, asset) in assets.into_iter().enumerate() {
            let origin = self.origin_limit(&asset.url)?;
            let fanout = Arc::clone(&self.fanout);
            let pending = Arc::clone(pending);

            set.spawn(async move {
                // Origin first so a slow host never pins global slots
                let _origin = origin
                    .acquire_owned()
                    .await
                    .map_err(|e| VaultError::Task(e.to_string()))?;
                let _global = fanout
                    .acquire_owned()
                    .await
                    .map_err(|e| VaultError::Task(e.to_string()))?;

                let FetchedAsset {
                    url,
                    relation,
                    bytes,
                } = asset;
                let put = pending.put(bytes).await?;

                Ok::<_, VaultError>((
                    index,
                    AssetEntry {
                        url,
                        hash: put.hash,
                        relation,
                        byte_size: put.size,
                    },
                ))
            });
        }

        let mut slots: Vec<Option<AssetEntry>> = vec![None; count];
        let mut first_error = None;

        while let Some(joined) = set.join_next().await {
            match joined.map_err(VaultError::from).and_then(|r| r) {
                Ok((index, entry)) => slots[index] = Some(entry),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(slots.into_iter().flatten().collect()),
        }
    }

    fn origin_limit(&self, asset_url: &str) -> Result<Arc<Semaphore>> {
        let origin = origin_of(asset_url);
        let mut origins = self
            .origins
            .lock()
            .map_err(|_| VaultError::Task("origin table poisoned".to_string()))?;
        let per_origin = self.limits.per_origin;
        Ok(Arc::clone(
            origins
                .entry(origin)
                .or_insert_with(|| Arc::new(Semaphore::new(per_origin))),
        ))
    }

    async fn register(&self, manifest: &Manifest) -> bool {
        let Some(ref catalog) = self.catalog else {
            return false;
        };

        let path = self
            .manifests
            .manifest_path(&manifest.run_id, &manifest.manifest_id);
        match catalog.register_manifest(manifest, &path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(manifest_id = %manifest.manifest_id, error = %e, "Catalog registration failed");
                // A catalog missing this row would answer lookups wrongly
                catalog.mark_stale();
                false
            }
        }
    }

    async fn journal_best_effort(&self, event: &JournalEvent) {
        if let Err(e) = self.journal.append(event).await {
            warn!(error = %e, "Failed to append journal event");
        }
    }
}

/// Blob references taken by a capture that has not committed yet.
///
/// Every blocking put and the manifest write hold a clone. Whichever holder
/// drops last releases the references unless the manifest was committed,
/// so a capture dropped mid-flight leaves no blobs behind.
#[derive(Debug)]
struct PendingRefs {
    blobs: BlobStore,
    hashes: Mutex<Vec<BlobHash>>,
    committed: AtomicBool,
}

impl PendingRefs {
    fn new(blobs: BlobStore) -> Arc<Self> {
        Arc::new(Self {
            blobs,
            hashes: Mutex::new(Vec::new()),
            committed: AtomicBool::new(false),
        })
    }

    /// Store bytes and record the reference in one blocking call
    async fn put(self: &Arc<Self>, bytes: Vec<u8>) -> Result<PutResult> {
        let pending = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let put = pending.blobs.put_blocking(&bytes)?;
            pending
                .hashes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(put.hash.clone());
            Ok::<_, VaultError>(put)
        })
        .await?
    }

    fn commit(&self) {
        self.committed.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> Vec<BlobHash> {
        std::mem::take(
            &mut *self
                .hashes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Release now, for captures that failed or lost the commit race
    async fn release(&self) {
        let hashes = self.take();
        if hashes.is_empty() {
            return;
        }
        let blobs = self.blobs.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || release_refs(&blobs, &hashes)).await {
            warn!(error = %e, "Release task failed; retention reconcile will repair counts");
        }
    }
}

impl Drop for PendingRefs {
    fn drop(&mut self) {
        if self.committed.load(Ordering::SeqCst) {
            return;
        }
        let hashes = std::mem::take(
            self.hashes
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if hashes.is_empty() {
            return;
        }

        warn!(references = hashes.len(), "Capture dropped before commit, releasing blob references");
        let blobs = self.blobs.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || release_refs(&blobs, &hashes));
            }
            Err(_) => release_refs(&blobs, &hashes),
        }
    }
}

fn release_refs(blobs: &BlobStore, hashes: &[BlobHash]) {
    for hash in hashes {
        if let Err(e) = blobs.delete_blocking(hash) {
            warn!(%hash, error = %e, "Failed to release blob reference; retention reconcile will repair it");
        }
    }
}

/// Origin (scheme, host, port) of a url; unparsable urls are their own origin
fn origin_of(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => parsed.origin().ascii_serialization(),
        Err(_) => raw.to_string(),
    }
}

/// One crawl session: single-touch per url within a run
#[derive(Debug)]
pub struct CaptureSession {
    engine: CaptureEngine,
    run_id: RunId,

    /// url -> manifest id, filled by whichever caller wins
    in_flight: Mutex<HashMap<String, Arc<OnceCell<ManifestId>>>>,

    summary: Mutex<RunSummary>,
}

impl CaptureSession {
    fn new(engine: CaptureEngine, run_id: RunId) -> Self {
        Self {
            engine,
            summary: Mutex::new(RunSummary::new(run_id.clone())),
            run_id,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Capture an already fetched result
    pub async fn capture(&self, fetch: FetchResult) -> Result<CaptureOutcome> {
        let url = fetch.url.clone();
        self.capture_with(&url, move || async move { fetch }).await
    }

    /// Capture `url`, running `fetch` only if this caller is the first for
    /// the url in this session. Concurrent callers wait for the first and
    /// get its manifest id back as a duplicate. If the first caller fails
    /// or is cancelled, the url is left open for a later attempt.
    pub async fn capture_with<F, Fut>(&self, url: &str, fetch: F) -> Result<CaptureOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        let cell = self.cell_for(url)?;

        let mut winner: Option<CaptureOutcome> = None;
        let slot = &mut winner;
        let result = cell
            .get_or_try_init(|| async move {
                let fetched = fetch().await;
                if fetched.url != url || fetched.run_id != self.run_id {
                    return Err(VaultError::InvalidInput(format!(
                        "fetch result for {} in run {} does not match {} in run {}",
                        fetched.url, fetched.run_id, url, self.run_id
                    )));
                }
                let outcome = self.engine.capture(fetched).await?;
                let manifest_id = outcome.manifest_id.clone();
                *slot = Some(outcome);
                Ok::<_, VaultError>(manifest_id)
            })
            .await
            .cloned();

        let outcome = match result {
            Ok(manifest_id) => match winner {
                Some(outcome) => outcome,
                None => {
                    debug!(url, %manifest_id, "Url already captured in this session");
                    self.engine
                        .journal_best_effort(
                            &JournalEvent::new(
                                self.run_id.clone(),
                                JournalEventType::CaptureDuplicate,
                                url,
                                "capture duplicate",
                            )
                            .with_manifest(manifest_id.clone()),
                        )
                        .await;
                    CaptureOutcome::duplicate(self.run_id.clone(), url.to_string(), manifest_id)
                }
            },
            Err(e) => {
                self.tally(|s| s.aborted += 1);
                return Err(e);
            }
        };

        self.tally(|s| match outcome.kind {
            CaptureKind::Committed => s.succeeded += 1,
            CaptureKind::Failed => s.failed += 1,
            CaptureKind::Duplicate => s.duplicates += 1,
        });

        Ok(outcome)
    }

    fn cell_for(&self, url: &str) -> Result<Arc<OnceCell<ManifestId>>> {
        let mut table = self
            .in_flight
            .lock()
            .map_err(|_| VaultError::Task("capture lock table poisoned".to_string()))?;
        Ok(Arc::clone(table.entry(url.to_string()).or_default()))
    }

    fn tally(&self, update: impl FnOnce(&mut RunSummary)) {
        if let Ok(mut summary) = self.summary.lock() {
            update(&mut summary);
            let now = Utc::now();
            summary.first_event_at.get_or_insert(now);
            summary.last_event_at = Some(now);
        }
    }

    /// Outcome counts for calls made through this session
    pub fn finish(self) -> RunSummary {
        let summary = self
            .summary
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            duplicates = summary.duplicates,
            aborted = summary.aborted,
            "Capture session finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShardSpec, StorageLayout};
    use crate::domain::{FailureKind, FetchFailure, Relation};
    use tempfile::TempDir;

    fn create_test_engine(limits: ConcurrencyLimits) -> (CaptureEngine, TempDir) {
        let temp = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp.path());
        let engine = CaptureEngine::new(
            BlobStore::open(&layout, ShardSpec::default()).unwrap(),
            ManifestStore::open(&layout).unwrap(),
            None,
            Journal::open(&layout).unwrap(),
            limits,
        );
        (engine, temp)
    }

    fn run() -> RunId {
        RunId::new("run-1").unwrap()
    }

    #[test]
    fn test_origin_of() {
        assert_eq!(origin_of("https://a.example/x/y.png"), "https://a.example");
        assert_eq!(origin_of("http://a.example:8080/"), "http://a.example:8080");
        assert_eq!(origin_of("not a url"), "not a url");
    }

    #[tokio::test]
    async fn test_capture_commits_manifest() {
        let (engine, _temp) = create_test_engine(ConcurrencyLimits::default());

        let fetch = FetchResult::new(run(), "https://a.example/", 200, b"hello".to_vec())
            .with_header("Content-Type", "text/html")
            .with_duration(7);
        let outcome = engine.capture(fetch).await.unwrap();

        assert_eq!(outcome.kind, CaptureKind::Committed);
        assert!(!outcome.catalogued);

        let manifest = engine
            .manifests
            .load(&outcome.run_id, &outcome.manifest_id)
            .await
            .unwrap();
        assert_eq!(manifest.primary_hash, Some(BlobHash::of(b"hello")));
        assert_eq!(manifest.total_bytes, 5);
        assert_eq!(manifest.fetch_duration_ms, 7);
        assert_eq!(manifest.header("content-type"), Some("text/html"));
    }

    #[tokio::test]
    async fn test_assets_keep_input_order() {
        let limits = ConcurrencyLimits {
            max_asset_fanout: 2,
            per_origin: 1,
            processing_workers: 1,
        };
        let (engine, _temp) = create_test_engine(limits);

        let mut fetch = FetchResult::new(run(), "https://a.example/", 200, b"page".to_vec());
        for i in 0..12 {
            let host = if i % 2 == 0 { "cdn1" } else { "cdn2" };
            fetch = fetch.with_asset(FetchedAsset::new(
                format!("https://{}.example/{}.js", host, i),
                Relation::Script,
                format!("asset {}", i).into_bytes(),
            ));
        }

        let outcome = engine.capture(fetch).await.unwrap();
        let manifest = engine
            .manifests
            .load(&outcome.run_id, &outcome.manifest_id)
            .await
            .unwrap();

        assert_eq!(manifest.assets.len(), 12);
        for (i, asset) in manifest.assets.iter().enumerate() {
            assert!(asset.url.ends_with(&format!("/{}.js", i)));
            assert_eq!(asset.hash, BlobHash::of(format!("asset {}", i).as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_failed_fetch_still_commits() {
        let (engine, _temp) = create_test_engine(ConcurrencyLimits::default());

        let fetch = FetchResult::failed(
            run(),
            "https://down.example/",
            FetchFailure::new(FailureKind::Timeout, "timed out after 30s"),
        );
        let outcome = engine.capture(fetch).await.unwrap();
        assert_eq!(outcome.kind, CaptureKind::Failed);

        let manifest = engine
            .manifests
            .load(&outcome.run_id, &outcome.manifest_id)
            .await
            .unwrap();
        assert_eq!(manifest.status, None);
        assert_eq!(manifest.primary_hash, None);
        assert_eq!(manifest.failure.unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_second_capture_is_duplicate() {
        let (engine, _temp) = create_test_engine(ConcurrencyLimits::default());

        let first = engine
            .capture(FetchResult::new(run(), "https://a.example/", 200, b"v1".to_vec()))
            .await
            .unwrap();
        let second = engine
            .capture(FetchResult::new(run(), "https://a.example/", 200, b"v2".to_vec()))
            .await
            .unwrap();

        assert!(second.is_duplicate());
        assert_eq!(first.manifest_id, second.manifest_id);
        // The second body was never stored
        assert!(!engine.blobs.exists(&BlobHash::of(b"v2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_uncommitted_refs_released_on_drop() {
        let (engine, _temp) = create_test_engine(ConcurrencyLimits::default());
        let pending = PendingRefs::new(engine.blobs.clone());
        let hash = pending.put(b"never committed".to_vec()).await.unwrap().hash;
        assert_eq!(engine.blobs.refcount(&hash).await.unwrap(), 1);

        drop(pending);

        // Release runs on the blocking pool
        for _ in 0..200 {
            if !engine.blobs.exists(&hash).await.unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!engine.blobs.exists(&hash).await.unwrap());
        assert_eq!(engine.blobs.refcount(&hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_committed_refs_survive_drop() {
        let (engine, _temp) = create_test_engine(ConcurrencyLimits::default());
        let pending = PendingRefs::new(engine.blobs.clone());
        let hash = pending.put(b"kept".to_vec()).await.unwrap().hash;

        pending.commit();
        drop(pending);

        assert_eq!(engine.blobs.refcount(&hash).await.unwrap(), 1);
        assert!(engine.blobs.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_runs_fetch_once() {
        let (engine, _temp) = create_test_engine(ConcurrencyLimits::default());
        let session = Arc::new(engine.session(run()));
        let fetches = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                session
                    .capture_with("https://a.example/x", || async move {
                        fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        FetchResult::new(run(), "https://a.example/x", 200, b"hello".to_vec())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(ids.iter().filter(|o| !o.is_duplicate()).count(), 1);
        assert!(ids.iter().all(|o| o.manifest_id == ids[0].manifest_id));

        let session = Arc::try_unwrap(session).unwrap();
        let summary = session.finish();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.duplicates, 7);
    }

    #[tokio::test]
    async fn test_session_rejects_mismatched_fetch() {
        let (engine, _temp) = create_test_engine(ConcurrencyLimits::default());
        let session = engine.session(run());

        let err = session
            .capture_with("https://a.example/", || async {
                FetchResult::new(run(), "https://b.example/", 200, b"x".to_vec())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidInput(_)));

        // The failed attempt leaves the url open
        let retry = session
            .capture(FetchResult::new(run(), "https://a.example/", 200, b"x".to_vec()))
            .await
            .unwrap();
        assert_eq!(retry.kind, CaptureKind::Committed);
    }
}
