//! Run summaries reconstructed from journal events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{JournalEvent, JournalEventType};
use super::manifest::RunId;

/// Outcome counts for one crawl session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,

    /// Manifests committed for successful fetches
    pub succeeded: usize,

    /// Manifests committed for failed fetches
    pub failed: usize,

    /// Captures that reused an existing manifest
    pub duplicates: usize,

    /// Captures abandoned on a storage error (no manifest)
    pub aborted: usize,

    /// Completed processing passes per processor
    pub processing_passes: BTreeMap<String, usize>,

    /// Processor failures on individual manifests
    pub processor_errors: usize,

    pub first_event_at: Option<DateTime<Utc>>,

    pub last_event_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            succeeded: 0,
            failed: 0,
            duplicates: 0,
            aborted: 0,
            processing_passes: BTreeMap::new(),
            processor_errors: 0,
            first_event_at: None,
            last_event_at: None,
        }
    }

    /// Reconstruct a summary by replaying events in order
    pub fn from_events(run_id: RunId, events: &[JournalEvent]) -> Self {
        let mut summary = Self::new(run_id);
        for event in events {
            summary.apply_event(event);
        }
        summary
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &JournalEvent) {
        match event.event_type {
            JournalEventType::CaptureCommitted => self.succeeded += 1,
            JournalEventType::CaptureFailed => self.failed += 1,
            JournalEventType::CaptureDuplicate => self.duplicates += 1,
            JournalEventType::CaptureAborted => self.aborted += 1,
            JournalEventType::ProcessingStarted => {}
            JournalEventType::ProcessingCompleted => {
                *self
                    .processing_passes
                    .entry(event.subject.clone())
                    .or_insert(0) += 1;
            }
            JournalEventType::ProcessorFailed => self.processor_errors += 1,
        }

        if self.first_event_at.is_none() {
            self.first_event_at = Some(event.timestamp);
        }
        self.last_event_at = Some(event.timestamp);
    }

    /// Manifests written during this run
    pub fn captured(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: JournalEventType, subject: &str) -> JournalEvent {
        JournalEvent::new(RunId::new("run-1").unwrap(), kind, subject, "test")
    }

    #[test]
    fn test_summary_from_events() {
        let events = vec![
            event(JournalEventType::CaptureCommitted, "https://a.example/1"),
            event(JournalEventType::CaptureCommitted, "https://a.example/2"),
            event(JournalEventType::CaptureFailed, "https://a.example/3"),
            event(JournalEventType::CaptureDuplicate, "https://a.example/1"),
            event(JournalEventType::ProcessingStarted, "word_count"),
            event(JournalEventType::ProcessorFailed, "word_count"),
            event(JournalEventType::ProcessingCompleted, "word_count"),
            event(JournalEventType::ProcessingCompleted, "word_count"),
        ];

        let summary = RunSummary::from_events(RunId::new("run-1").unwrap(), &events);

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.captured(), 3);
        assert_eq!(summary.processor_errors, 1);
        assert_eq!(summary.processing_passes.get("word_count"), Some(&2));
        assert!(summary.first_event_at <= summary.last_event_at);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RunSummary::from_events(RunId::new("run-1").unwrap(), &[]);
        assert_eq!(summary.captured(), 0);
        assert!(summary.first_event_at.is_none());
    }
}
