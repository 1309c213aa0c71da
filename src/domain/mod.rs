//! Domain types for the vault.
//!
//! This module contains the core data structures:
//! - Manifest: immutable capture record and its identifiers
//! - FetchResult: input supplied by the fetch layer
//! - DerivedRecord: one line of processor output
//! - JournalEvent / RunSummary: run outcome history

pub mod artifact;
pub mod events;
pub mod fetch;
pub mod manifest;
pub mod run;

// Re-export commonly used types
pub use artifact::DerivedRecord;
pub use events::{JournalEvent, JournalEventType};
pub use fetch::{FetchResult, FetchedAsset};
pub use manifest::{
    AssetEntry, BlobHash, FailureKind, FetchFailure, Header, Manifest, ManifestId, Relation,
    RunId, MANIFEST_VERSION,
};
pub use run::RunSummary;
