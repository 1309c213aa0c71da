//! HTML title extraction.

use scraper::{Html, Selector};
use serde_json::{json, Value};

use super::collapse_whitespace;
use crate::core::Processor;
use crate::domain::Manifest;
use crate::store::BlobReader;

/// Emits `{"title": ...}` for every capture with a body; `null` when the
/// document has no `<title>`
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractTitle;

impl Processor for ExtractTitle {
    fn name(&self) -> &str {
        "extract_title"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, manifest: &Manifest, blobs: &BlobReader) -> anyhow::Result<Vec<Value>> {
        let Some(ref hash) = manifest.primary_hash else {
            return Ok(Vec::new());
        };

        let body = blobs.read_text(hash)?;
        Ok(vec![json!({ "title": find_title(&body) })])
    }
}

/// First `<title>` element, whitespace collapsed
fn find_title(html: &str) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let document = Html::parse_document(html);
    let element = document.select(&selector).next()?;

    let title = collapse_whitespace(&element.text().collect::<String>());
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_title() {
        assert_eq!(
            find_title("<html><head><TITLE>  Hello\n  World </TITLE></head></html>"),
            Some("Hello World".to_string())
        );
        assert_eq!(
            find_title("<title lang=\"en\">Attr</title>"),
            Some("Attr".to_string())
        );
        assert_eq!(find_title("<titles>x</titles><title>Real</title>"), Some("Real".to_string()));
        assert_eq!(find_title("<p>no title</p>"), None);
        assert_eq!(find_title("<title></title>"), None);
        // Title text runs to the end of an unterminated document
        assert_eq!(find_title("<title>unterminated"), Some("unterminated".to_string()));
    }
}
