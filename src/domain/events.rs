//! Journal events for capture and processing outcomes.
//!
//! The journal is an append-only log per run. It is operational history,
//! not the source of truth: manifests are. Summaries are derived by
//! replaying these events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::manifest::{ManifestId, RunId};

/// A single event in the run journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: RunId,

    /// Type of event
    pub event_type: JournalEventType,

    /// URL for capture events, processor name for processing events
    pub subject: String,

    /// Manifest involved (if any)
    pub manifest_id: Option<ManifestId>,

    /// Human-readable summary
    pub summary: String,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl JournalEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: RunId,
        event_type: JournalEventType,
        subject: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            event_type,
            subject: subject.into(),
            manifest_id: None,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_manifest(mut self, manifest_id: ManifestId) -> Self {
        self.manifest_id = Some(manifest_id);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of journal events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    /// Manifest committed for a successful fetch
    CaptureCommitted,

    /// Manifest committed recording a failed fetch
    CaptureFailed,

    /// Capture skipped: the (run, url) pair was already captured
    CaptureDuplicate,

    /// Local storage failure; no manifest was written
    CaptureAborted,

    /// A processing pass started for one processor
    ProcessingStarted,

    /// A processing pass finished writing its output file
    ProcessingCompleted,

    /// One processor failed on one manifest
    ProcessorFailed,
}
