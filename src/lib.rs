//! capvault - Capture-then-process storage engine for fetched web content
//!
//! Raw fetch results are persisted immutably before any processing happens.
//! Processing is a separate, replayable phase that reads the raw zone and
//! regenerates derived output.
//!
//! # Architecture
//!
//! The store is split into zones:
//! - RAW: content-addressed blobs plus one write-once manifest per capture
//! - DERIVED: per-run processor output, safe to delete and regenerate
//! - INDEX: a SQLite catalog and per-run journals, both rebuildable
//!
//! A capture is committed when its manifest file is persisted; everything
//! else (catalog rows, journal lines, derived files) can be reconstructed
//! from the manifests and blobs.
//!
//! # Modules
//!
//! - `store`: CAS blob store, manifest tree, catalog
//! - `core`: capture engine, processing pipeline, journal, retention, Vault
//! - `processors`: built-in processors
//! - `domain`: data structures (Manifest, FetchResult, DerivedRecord, ...)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Capture a fetched page into run "crawl-1"
//! capvault capture https://a.example/ --run crawl-1 --body page.html -H "Content-Type: text/html"
//!
//! # Run processors, then replay and check the output is unchanged
//! capvault process crawl-1
//! capvault replay crawl-1
//!
//! # Look up every capture of a URL
//! capvault find --url https://a.example/
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod processors;
pub mod store;

// Re-export main types at crate root for convenience
pub use crate::config::{ConcurrencyLimits, ShardSpec, StorageLayout, VaultConfig};
pub use crate::core::{
    CaptureKind, CaptureOutcome, CaptureSession, FnProcessor, ProcessReport, Processor,
    ProcessorOutput, ProcessorRegistry, Retention, StorageStats, Vault,
};
pub use domain::{
    AssetEntry, BlobHash, DerivedRecord, FailureKind, FetchFailure, FetchResult, FetchedAsset,
    Manifest, ManifestId, Relation, RunId, RunSummary,
};
pub use error::{CatalogError, IntegrityError, Result, VaultError};
pub use store::{BlobReader, ManifestRef};
