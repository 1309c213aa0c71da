//! Core engine.
//!
//! This module contains:
//! - Capture: store fetch results and commit manifests (single-touch)
//! - Pipeline: processors and deterministic derived output
//! - Journal: append-only per-run outcome log
//! - Retention: run deletion and reference count repair
//! - Vault: the public entry point

pub mod capture;
pub mod journal;
pub mod pipeline;
pub mod retention;
pub mod vault;

// Re-export commonly used types
pub use capture::{CaptureEngine, CaptureKind, CaptureOutcome, CaptureSession};
pub use journal::Journal;
pub use pipeline::{
    FnProcessor, ProcessReport, Processor, ProcessorOutput, ProcessorRegistry, ProcessingPipeline,
};
pub use retention::{DropReport, ReconcileReport, Retention};
pub use vault::{StorageStats, Vault};
