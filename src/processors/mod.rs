//! Built-in processors.
//!
//! Each processor turns one manifest into zero or more JSON records:
//! - `word_count`: word and byte counts of the primary body
//! - `extract_title`: the HTML `<title>` of the primary body
//! - `asset_inventory`: one record per stored asset

pub mod asset_inventory;
pub mod extract_title;
pub mod word_count;

use std::sync::Arc;

use scraper::Html;

use crate::core::{Processor, ProcessorRegistry};
use crate::error::Result;

pub use asset_inventory::AssetInventory;
pub use extract_title::ExtractTitle;
pub use word_count::WordCount;

/// Fresh instances of every built-in processor
pub fn builtin() -> Vec<Arc<dyn Processor>> {
    vec![
        Arc::new(AssetInventory),
        Arc::new(ExtractTitle),
        Arc::new(WordCount),
    ]
}

/// Register every built-in processor
pub fn register_builtins(registry: &mut ProcessorRegistry) -> Result<()> {
    for processor in builtin() {
        registry.register(processor)?;
    }
    Ok(())
}

/// Elements whose text never renders
const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "template", "noscript"];

/// Visible text of an HTML document: every text node outside script,
/// style and template content, separated by spaces and collapsed
pub(crate) fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::with_capacity(html.len());

    for node in document.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| HIDDEN_ELEMENTS.contains(&element.name()))
        });
        if !hidden {
            raw.push_str(text);
            raw.push(' ');
        }
    }

    collapse_whitespace(&raw)
}

pub(crate) fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_register_once() {
        let mut registry = ProcessorRegistry::new();
        register_builtins(&mut registry).unwrap();
        assert_eq!(
            registry.names(),
            vec!["asset_inventory", "extract_title", "word_count"]
        );
        assert!(register_builtins(&mut registry).is_err());
    }

    #[test]
    fn test_visible_text() {
        let html = "<html><head><style>p { color: red }</style><script>var x = 1;</script></head>\
                    <body><!-- hidden --><p>Hello <b>world</b></p></body></html>";
        let words: Vec<_> = visible_text(html).split_whitespace().map(String::from).collect();
        assert_eq!(words, vec!["Hello", "world"]);
    }

    #[test]
    fn test_visible_text_plain() {
        assert_eq!(visible_text("no markup here"), "no markup here");
    }

    #[test]
    fn test_visible_text_separates_blocks() {
        assert_eq!(
            visible_text("<p>one</p><p>two</p><noscript>enable js</noscript>"),
            "one two"
        );
    }
}
