//! Core domain model for the MML catalog sync.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub mod env;

pub const CRATE_NAME: &str = "mml-core";

/// Number of components in every stored embedding vector.
pub const EMBEDDING_DIM: usize = 768;

/// One raw product as the storefront publishes it in the collection JSON.
/// Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub variants: Vec<ListingVariant>,
    #[serde(default)]
    pub images: Vec<ListingImage>,
    #[serde(default)]
    pub options: Vec<ListingOption>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingVariant {
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub compare_at_price: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingImage {
    #[serde(default)]
    pub src: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingOption {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Heuristic audience classification. The store is mostly menswear, so
/// `Man` is the default when no marker matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[default]
    Man,
    Woman,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Man => "man",
            Gender::Woman => "woman",
        }
    }
}

/// Structured leftovers kept alongside the normalized fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub vendor: Option<String>,
    pub product_type: Option<String>,
    pub tags: Vec<String>,
    pub variants_count: usize,
    pub options: JsonValue,
}

/// Canonical embedding-free representation of one Listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub product_url: String,
    pub image_url: String,
    /// Remaining image URLs joined with `" , "`; empty when the listing
    /// has at most one image.
    pub additional_images: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub gender: Gender,
    /// `"<amount><currency>"`, e.g. `159.99EUR`. Original price when a
    /// compare-at value exists, otherwise the direct price.
    pub price: Option<String>,
    /// Present only when the direct price undercuts the compare-at price.
    pub sale: Option<String>,
    pub size: Option<String>,
    pub metadata: Option<Metadata>,
    pub tags: Vec<String>,
}

/// The full persisted row shape for the `products` table.
///
/// Struct serialization keeps every row in a batch on the same field set,
/// which PostgREST bulk upserts require; intentionally absent attributes
/// serialize as explicit nulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    pub source: String,
    pub product_url: String,
    pub affiliate_url: Option<String>,
    pub image_url: String,
    pub brand: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub gender: Gender,
    /// Metadata serialized to text for storage.
    pub metadata: Option<String>,
    pub size: Option<String>,
    pub second_hand: bool,
    pub country: Option<String>,
    pub compressed_image_url: Option<String>,
    pub tags: Vec<String>,
    pub other: Option<String>,
    pub price: Option<String>,
    pub sale: Option<String>,
    pub additional_images: Option<String>,
    pub image_embedding: Option<Vec<f32>>,
    pub info_embedding: Option<Vec<f32>>,
}

/// Deterministic storage identity: hex SHA-256 of `"{source}:{product_url}"`.
///
/// The same `(source, product_url)` pair always hashes to the same id, so
/// re-upserting a product replaces its prior row rather than duplicating it.
pub fn identity(source: &str, product_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(product_url.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_deterministic() {
        let a = identity("scraper", "https://example.com/en/products/hoodie");
        let b = identity("scraper", "https://example.com/en/products/hoodie");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identity_differs_per_url_and_source() {
        let base = identity("scraper", "https://example.com/en/products/hoodie");
        assert_ne!(
            base,
            identity("scraper", "https://example.com/en/products/tee")
        );
        assert_ne!(
            base,
            identity("other", "https://example.com/en/products/hoodie")
        );
    }

    #[test]
    fn listing_parses_from_shopify_product_json() {
        let listing: Listing = serde_json::from_value(serde_json::json!({
            "handle": "og-hoodie",
            "title": "OG Hoodie",
            "body_html": "<p>Heavy fleece</p>",
            "vendor": "MML",
            "product_type": "Sweaters & Hoodies",
            "tags": ["new", "hoodie"],
            "variants": [{"price": "54.99", "compare_at_price": "159.99"}],
            "images": [{"src": "https://cdn.example.com/a.jpg"}],
            "options": [{"name": "Size", "values": ["S", "M", "L"]}]
        }))
        .unwrap();
        assert_eq!(listing.handle, "og-hoodie");
        assert_eq!(listing.variants[0].price.as_deref(), Some("54.99"));
        assert_eq!(listing.options[0].values.len(), 3);
    }

    #[test]
    fn listing_tolerates_missing_fields() {
        let listing: Listing =
            serde_json::from_value(serde_json::json!({"handle": "bare"})).unwrap();
        assert!(listing.variants.is_empty());
        assert!(listing.images.is_empty());
        assert!(listing.body_html.is_none());
    }

    #[test]
    fn row_serializes_absent_optionals_as_nulls() {
        let row = Row {
            id: "abc".into(),
            source: "scraper".into(),
            product_url: "https://example.com/p".into(),
            affiliate_url: None,
            image_url: "https://cdn.example.com/a.jpg".into(),
            brand: "MML".into(),
            title: "Tee".into(),
            description: None,
            category: None,
            gender: Gender::Man,
            metadata: None,
            size: None,
            second_hand: false,
            country: Some("DE".into()),
            compressed_image_url: None,
            tags: vec![],
            other: None,
            price: None,
            sale: None,
            additional_images: None,
            image_embedding: None,
            info_embedding: None,
        };
        let value = serde_json::to_value(&row).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.get("affiliate_url").unwrap().is_null());
        assert!(object.get("image_embedding").unwrap().is_null());
        assert_eq!(object.get("gender").unwrap(), "man");
        // Every row in a batch must expose the identical key set.
        assert_eq!(object.len(), 22);
    }
}
