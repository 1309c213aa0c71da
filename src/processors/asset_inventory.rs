//! Inventory of the assets stored with a capture.

use serde_json::{json, Value};

use crate::core::Processor;
use crate::domain::Manifest;
use crate::store::BlobReader;

/// One record per asset, in manifest order, noting whether its blob is
/// still present in the store
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetInventory;

impl Processor for AssetInventory {
    fn name(&self) -> &str {
        "asset_inventory"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn process(&self, manifest: &Manifest, blobs: &BlobReader) -> anyhow::Result<Vec<Value>> {
        let mut records = Vec::with_capacity(manifest.assets.len());
        for asset in &manifest.assets {
            records.push(json!({
                "url": asset.url,
                "relation": asset.relation,
                "hash": asset.hash,
                "byte_size": asset.byte_size,
                "present": blobs.exists(&asset.hash)?,
            }));
        }
        Ok(records)
    }
}
