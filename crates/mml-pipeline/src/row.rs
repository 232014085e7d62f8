//! Row assembly: identity plus the full persisted shape. Pure; no I/O.

use mml_core::{identity, Record, Row};
use tracing::warn;

use crate::SyncConfig;

/// Assemble the persisted row for one record. Intentionally-absent
/// attributes (affiliate_url, compressed_image_url, other) are explicit
/// nulls; whichever embeddings were produced ride along.
pub fn build_row(
    config: &SyncConfig,
    record: &Record,
    image_embedding: Option<Vec<f32>>,
    info_embedding: Option<Vec<f32>>,
) -> Row {
    let id = identity(&config.source, &record.product_url);
    let metadata = record.metadata.as_ref().and_then(|metadata| {
        match serde_json::to_string(metadata) {
            Ok(json) => Some(json),
            Err(err) => {
                warn!(product_url = %record.product_url, error = %err, "metadata serialization failed");
                None
            }
        }
    });

    Row {
        id,
        source: config.source.clone(),
        product_url: record.product_url.clone(),
        affiliate_url: None,
        image_url: record.image_url.clone(),
        brand: config.brand.clone(),
        title: record.title.clone(),
        description: record.description.clone(),
        category: record.category.clone(),
        gender: record.gender,
        metadata,
        size: record.size.clone(),
        second_hand: config.second_hand,
        country: config.country.clone(),
        compressed_image_url: None,
        tags: record.tags.clone(),
        other: None,
        price: record.price.clone(),
        sale: record.sale.clone(),
        additional_images: if record.additional_images.is_empty() {
            None
        } else {
            Some(record.additional_images.clone())
        },
        image_embedding,
        info_embedding,
    }
}
