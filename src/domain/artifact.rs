//! Derived records written by processors.
//!
//! One record is one JSON line in a derived file. Every record carries the
//! id of the manifest it was computed from.

use serde::{Deserialize, Serialize};

use super::manifest::ManifestId;

/// A single line of derived output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    /// Source manifest (lineage)
    pub manifest_id: ManifestId,

    /// URL of the source capture
    pub url: String,

    /// Processor that produced this record
    pub processor: String,

    pub processor_version: String,

    /// Structured output (absent on error records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,

    /// Failure message (present only on error records)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DerivedRecord {
    pub fn ok(
        manifest_id: ManifestId,
        url: impl Into<String>,
        processor: impl Into<String>,
        processor_version: impl Into<String>,
        record: serde_json::Value,
    ) -> Self {
        Self {
            manifest_id,
            url: url.into(),
            processor: processor.into(),
            processor_version: processor_version.into(),
            record: Some(record),
            error: None,
        }
    }

    pub fn failed(
        manifest_id: ManifestId,
        url: impl Into<String>,
        processor: impl Into<String>,
        processor_version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            manifest_id,
            url: url.into(),
            processor: processor.into(),
            processor_version: processor_version.into(),
            record: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
