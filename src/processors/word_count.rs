//! Word and byte counts of a capture's primary body.

use serde_json::{json, Value};

use super::visible_text;
use crate::core::Processor;
use crate::domain::Manifest;
use crate::store::BlobReader;

/// Counts words in the visible text of the primary body.
/// Captures without a body produce no record.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCount;

impl Processor for WordCount {
    fn name(&self) -> &str {
        "word_count"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, manifest: &Manifest, blobs: &BlobReader) -> anyhow::Result<Vec<Value>> {
        let Some(ref hash) = manifest.primary_hash else {
            return Ok(Vec::new());
        };

        let body = blobs.read_text(hash)?;
        let is_html = manifest
            .header("content-type")
            .map(|ct| ct.to_ascii_lowercase().contains("html"))
            .unwrap_or_else(|| body.trim_start().starts_with('<'));

        let words = if is_html {
            visible_text(&body).split_whitespace().count()
        } else {
            body.split_whitespace().count()
        };

        Ok(vec![json!({
            "words": words,
            "bytes": body.len(),
            "status": manifest.status,
        })])
    }
}
