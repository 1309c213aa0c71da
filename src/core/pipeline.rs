//! Processing pipeline: phase two of capture-then-process.
//!
//! Processing reads committed manifests and their blobs and writes derived
//! JSONL files, one per processor, at `derived/<run_id>/<processor>.jsonl`.
//! It never touches the raw zone. Output is a pure function of the
//! manifests and the processor versions, so replay reproduces the same
//! bytes. Reprocessing is never scheduled automatically; callers run
//! [`ProcessingPipeline::process_run`] or [`ProcessingPipeline::replay`].

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::journal::Journal;
use crate::config::StorageLayout;
use crate::domain::{DerivedRecord, JournalEvent, JournalEventType, Manifest, RunId};
use crate::error::{Result, VaultError};
use crate::store::{write_atomic, BlobReader, BlobStore, ManifestStore, Persist};

/// A deterministic transformation from one manifest to derived records.
///
/// Implementations get read-only blob access and must not depend on wall
/// clock time or iteration order of unordered collections, so that replay
/// produces identical output.
pub trait Processor: Send + Sync {
    /// Unique name; also the output file stem
    fn name(&self) -> &str;

    /// Bumped whenever the output for the same input changes
    fn version(&self) -> &str;

    /// Produce zero or more records for one manifest
    fn process(&self, manifest: &Manifest, blobs: &BlobReader) -> anyhow::Result<Vec<Value>>;
}

/// Adapts a closure to [`Processor`]
pub struct FnProcessor<F> {
    name: String,
    version: String,
    func: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&Manifest, &BlobReader) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, version: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            func,
        }
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&Manifest, &BlobReader) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn process(&self, manifest: &Manifest, blobs: &BlobReader) -> anyhow::Result<Vec<Value>> {
        (self.func)(manifest, blobs)
    }
}

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcessor")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

/// Explicit table of processors keyed by name
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Arc<dyn Processor>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.processors.keys()).finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor. Names must be unique and usable as a file stem.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Result<()> {
        let name = processor.name().to_string();
        validate_processor_name(&name)?;

        if self.processors.contains_key(&name) {
            return Err(VaultError::DuplicateProcessor(name));
        }

        debug!(processor = %name, version = processor.version(), "Registered processor");
        self.processors.insert(name, processor);
        Ok(())
    }

    /// Register a closure as a processor
    pub fn register_fn<F>(&mut self, name: &str, version: &str, func: F) -> Result<()>
    where
        F: Fn(&Manifest, &BlobReader) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnProcessor::new(name, version, func)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.processors.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Processors whose names match any of `patterns` (glob syntax), sorted
    /// by name. No patterns selects everything. A pattern that matches
    /// nothing is an error.
    pub fn select(&self, patterns: &[String]) -> Result<Vec<Arc<dyn Processor>>> {
        if patterns.is_empty() {
            return Ok(self.processors.values().cloned().collect());
        }

        let mut selected: BTreeMap<&str, Arc<dyn Processor>> = BTreeMap::new();
        for raw in patterns {
            let pattern = glob::Pattern::new(raw)
                .map_err(|e| VaultError::InvalidInput(format!("Bad processor pattern {:?}: {}", raw, e)))?;

            let before = selected.len();
            let mut matched = false;
            for (name, processor) in &self.processors {
                if pattern.matches(name) {
                    matched = true;
                    selected.insert(name.as_str(), Arc::clone(processor));
                }
            }
            if !matched {
                return Err(VaultError::UnknownProcessor(raw.clone()));
            }
            debug!(pattern = %raw, added = selected.len() - before, "Selected processors");
        }

        Ok(selected.into_values().collect())
    }
}

fn validate_processor_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VaultError::InvalidInput(format!("Invalid processor name: {:?}", name)))
    }
}

/// Result of one processor over one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorOutput {
    pub processor: String,
    pub version: String,
    pub path: PathBuf,
    /// Successful record lines
    pub records: usize,
    /// Error lines
    pub errors: usize,
    /// SHA-256 of the output file
    pub digest: String,
    /// Set by replay: whether the output matches the previous file.
    /// `None` when there was no previous file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identical: Option<bool>,
}

/// Result of a processing pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub run_id: RunId,
    /// Manifests read
    pub manifests: usize,
    pub outputs: Vec<ProcessorOutput>,
    pub duration_ms: u64,
}

impl ProcessReport {
    pub fn output(&self, processor: &str) -> Option<&ProcessorOutput> {
        self.outputs.iter().find(|o| o.processor == processor)
    }

    pub fn total_errors(&self) -> usize {
        self.outputs.iter().map(|o| o.errors).sum()
    }

    /// True when every output had a previous file with identical bytes
    pub fn all_identical(&self) -> bool {
        self.outputs.iter().all(|o| o.identical == Some(true))
    }
}

/// Runs processors over the manifests of a run
#[derive(Debug, Clone)]
pub struct ProcessingPipeline {
    manifests: ManifestStore,
    blobs: BlobStore,
    journal: Journal,
    derived_dir: PathBuf,
    workers: usize,
}

impl ProcessingPipeline {
    pub fn new(
        layout: &StorageLayout,
        manifests: ManifestStore,
        blobs: BlobStore,
        journal: Journal,
        workers: usize,
    ) -> Self {
        Self {
            manifests,
            blobs,
            journal,
            derived_dir: layout.derived_dir(),
            workers: workers.max(1),
        }
    }

    /// Derived output path of one processor for one run
    pub fn output_path(&self, run_id: &RunId, processor: &str) -> PathBuf {
        self.derived_dir
            .join(run_id.as_str())
            .join(format!("{}.jsonl", processor))
    }

    /// Run the selected processors over every manifest of the run.
    ///
    /// A processor error or panic on one manifest becomes an error line and
    /// the run continues. Each output file is replaced atomically.
    #[instrument(skip(self, registry), fields(run_id = %run_id))]
    pub async fn process_run(
        &self,
        run_id: &RunId,
        registry: &ProcessorRegistry,
        patterns: &[String],
    ) -> Result<ProcessReport> {
        let start = Instant::now();
        let processors = registry.select(patterns)?;

        let manifests = self.manifests.list_run(run_id).await?;
        if manifests.is_empty() {
            return Err(VaultError::NotFound(format!("manifests for run {}", run_id)));
        }

        info!(
            manifests = manifests.len(),
            processors = processors.len(),
            "Processing run"
        );

        for processor in &processors {
            self.journal_best_effort(JournalEvent::new(
                run_id.clone(),
                JournalEventType::ProcessingStarted,
                processor.name(),
                format!("Processing {} manifests", manifests.len()),
            ))
            .await;
        }

        // records[manifest index][processor index]
        let records = self.run_workers(&manifests, &processors).await?;

        let run_dir = self.derived_dir.join(run_id.as_str());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| VaultError::storage(&run_dir, e))?;

        let mut outputs = Vec::with_capacity(processors.len());

        for (p_index, processor) in processors.iter().enumerate() {
            let mut buffer = Vec::new();
            let mut ok_lines = 0;
            let mut error_lines = 0;

            for per_manifest in &records {
                for record in &per_manifest[p_index] {
                    if record.is_error() {
                        error_lines += 1;
                        self.journal_best_effort(
                            JournalEvent::new(
                                run_id.clone(),
                                JournalEventType::ProcessorFailed,
                                processor.name(),
                                format!("{} failed on {}", processor.name(), record.url),
                            )
                            .with_manifest(record.manifest_id.clone())
                            .with_error(record.error.clone().unwrap_or_default()),
                        )
                        .await;
                    } else {
                        ok_lines += 1;
                    }
                    serde_json::to_writer(&mut buffer, record)?;
                    buffer.push(b'\n');
                }
            }

            let path = self.output_path(run_id, processor.name());
            let digest = digest_hex(&buffer);
            // Staged next to the target; the raw zone stays read-only
            let staging = run_dir.clone();
            let target = path.clone();
            tokio::task::spawn_blocking(move || {
                write_atomic(&staging, &target, &buffer, Persist::Replace)
            })
            .await??;

            info!(
                processor = processor.name(),
                records = ok_lines,
                errors = error_lines,
                path = %path.display(),
                "Wrote derived output"
            );

            self.journal_best_effort(JournalEvent::new(
                run_id.clone(),
                JournalEventType::ProcessingCompleted,
                processor.name(),
                format!("{} records, {} errors", ok_lines, error_lines),
            ))
            .await;

            outputs.push(ProcessorOutput {
                processor: processor.name().to_string(),
                version: processor.version().to_string(),
                path,
                records: ok_lines,
                errors: error_lines,
                digest,
                identical: None,
            });
        }

        Ok(ProcessReport {
            run_id: run_id.clone(),
            manifests: manifests.len(),
            outputs,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Re-run processing and report whether each output reproduced the
    /// previous file byte for byte
    #[instrument(skip(self, registry), fields(run_id = %run_id))]
    pub async fn replay(
        &self,
        run_id: &RunId,
        registry: &ProcessorRegistry,
        patterns: &[String],
    ) -> Result<ProcessReport> {
        let mut previous = BTreeMap::new();
        for processor in registry.select(patterns)? {
            let path = self.output_path(run_id, processor.name());
            if let Some(digest) = file_digest(&path).await? {
                previous.insert(processor.name().to_string(), digest);
            }
        }

        let mut report = self.process_run(run_id, registry, patterns).await?;

        for output in &mut report.outputs {
            output.identical = previous
                .get(&output.processor)
                .map(|digest| *digest == output.digest);
            if output.identical == Some(false) {
                warn!(processor = %output.processor, "Replay output differs from previous run");
            }
        }

        Ok(report)
    }

    /// Run every manifest through every processor on the blocking pool,
    /// bounded by the worker count. Results are indexed by manifest order.
    async fn run_workers(
        &self,
        manifests: &[Manifest],
        processors: &[Arc<dyn Processor>],
    ) -> Result<Vec<Vec<Vec<DerivedRecord>>>> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let processors: Arc<Vec<Arc<dyn Processor>>> = Arc::new(processors.to_vec());
        let mut set = JoinSet::new();

        for (index, manifest) in manifests.iter().cloned().enumerate() {
            let permits = Arc::clone(&permits);
            let processors = Arc::clone(&processors);
            let reader = self.blobs.reader();

            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| VaultError::Task(e.to_string()))?;
                let records = tokio::task::spawn_blocking(move || {
                    processors
                        .iter()
                        .map(|p| run_processor(p.as_ref(), &manifest, &reader))
                        .collect::<Vec<_>>()
                })
                .await?;
                Ok::<_, VaultError>((index, records))
            });
        }

        let mut results: Vec<Vec<Vec<DerivedRecord>>> = vec![Vec::new(); manifests.len()];
        while let Some(joined) = set.join_next().await {
            let (index, records) = joined??;
            results[index] = records;
        }

        Ok(results)
    }

    async fn journal_best_effort(&self, event: JournalEvent) {
        if let Err(e) = self.journal.append(&event).await {
            warn!(error = %e, "Failed to append journal event");
        }
    }
}

/// One processor on one manifest; failures and panics become an error record
fn run_processor(
    processor: &dyn Processor,
    manifest: &Manifest,
    reader: &BlobReader,
) -> Vec<DerivedRecord> {
    let name = processor.name();
    let version = processor.version();

    let result = catch_unwind(AssertUnwindSafe(|| processor.process(manifest, reader)));

    let error = match result {
        Ok(Ok(values)) => {
            return values
                .into_iter()
                .map(|value| {
                    DerivedRecord::ok(
                        manifest.manifest_id.clone(),
                        &manifest.url,
                        name,
                        version,
                        value,
                    )
                })
                .collect();
        }
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
    };

    warn!(processor = name, manifest_id = %manifest.manifest_id, error = %error, "Processor failed");
    vec![DerivedRecord::failed(
        manifest.manifest_id.clone(),
        &manifest.url,
        name,
        version,
        error,
    )]
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn file_digest(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(digest_hex(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VaultError::storage(path, e)),
    }
}
