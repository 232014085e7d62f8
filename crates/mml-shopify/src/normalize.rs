//! Pure Listing → Record normalization.

use mml_core::{Gender, Listing, Metadata, Record};
use scraper::Html;
use serde_json::Value as JsonValue;

/// The storefront displays every price in euros.
pub const CURRENCY: &str = "EUR";

/// Strip all markup from a rich-text body, collapsing whitespace.
pub fn strip_html(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(html);
    let text = fragment
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"Sweaters & Hoodies"` → `"Sweaters, Hoodies"`. Absent or empty → None.
pub fn normalize_category(product_type: Option<&str>) -> Option<String> {
    let raw = product_type?;
    let out = raw.replace(" & ", ", ").replace(" and ", ", ");
    let out = out.trim();
    if out.is_empty() {
        None
    } else {
        Some(out.to_string())
    }
}

/// Heuristic: `Woman` only for girls/women markers in tags, type, or title;
/// everything else is `Man`. Meant to be replaced by a mapping table if the
/// storefront ever labels audiences explicitly.
pub fn infer_gender(listing: &Listing) -> Gender {
    let ptype = listing
        .product_type
        .as_deref()
        .unwrap_or_default()
        .to_uppercase();
    let title = listing.title.to_uppercase();
    if ptype.contains("GIRLS")
        || title.contains("GIRLS")
        || listing
            .tags
            .iter()
            .any(|tag| tag.to_uppercase().contains("GIRL"))
    {
        return Gender::Woman;
    }
    if ptype.contains("WOMEN") || title.contains("WOMEN") {
        return Gender::Woman;
    }
    Gender::Man
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Fixed two-decimal amount plus currency code; unparseable amounts pass
/// through with the suffix appended.
fn format_amount(raw: &str) -> String {
    match raw.trim().parse::<f64>() {
        Ok(value) => format!("{value:.2}{CURRENCY}"),
        Err(_) => format!("{raw}{CURRENCY}"),
    }
}

/// Original price from the first variant: compare-at when present, the
/// direct price otherwise, neither → None.
pub fn price_string(listing: &Listing) -> Option<String> {
    let variant = listing.variants.first()?;
    let value = non_empty(variant.compare_at_price.as_deref())
        .or_else(|| non_empty(variant.price.as_deref()))?;
    Some(format_amount(value))
}

/// Sale price, present only when the direct price is strictly below the
/// compare-at price.
pub fn sale_value(listing: &Listing) -> Option<String> {
    let variant = listing.variants.first()?;
    let price = non_empty(variant.price.as_deref())?;
    let compare = non_empty(variant.compare_at_price.as_deref())?;
    match (price.trim().parse::<f64>(), compare.trim().parse::<f64>()) {
        (Ok(p), Ok(c)) if p < c => Some(format!("{p:.2}{CURRENCY}")),
        _ => None,
    }
}

pub fn product_url(base_url: &str, handle: &str) -> String {
    format!("{base_url}/en/products/{handle}")
}

/// First image is the primary; the rest collapse into one `" , "`-joined
/// string. No images → empty primary, which the orchestrator treats as
/// "skip this record".
pub fn image_urls(listing: &Listing) -> (String, String) {
    let urls: Vec<&str> = listing
        .images
        .iter()
        .filter_map(|img| non_empty(img.src.as_deref()))
        .collect();
    let Some((first, rest)) = urls.split_first() else {
        return (String::new(), String::new());
    };
    ((*first).to_string(), rest.join(" , "))
}

/// Comma-joined values of the size option, matched against localized
/// synonyms for "size".
pub fn sizes(listing: &Listing) -> Option<String> {
    const SIZE_NAMES: [&str; 3] = ["size", "größe", "grösse"];
    listing.options.iter().find_map(|option| {
        let name = option.name.as_deref()?.to_lowercase();
        if SIZE_NAMES.contains(&name.as_str()) {
            Some(option.values.join(", "))
        } else {
            None
        }
    })
}

/// Convert one raw listing into the canonical record. Pure; embeddings are
/// attached later by the pipeline.
pub fn to_record(listing: &Listing, base_url: &str) -> Record {
    let (image_url, additional_images) = image_urls(listing);
    let description = listing
        .body_html
        .as_deref()
        .map(strip_html)
        .filter(|text| !text.is_empty());

    let metadata = Metadata {
        vendor: listing.vendor.clone(),
        product_type: listing.product_type.clone(),
        tags: listing.tags.clone(),
        variants_count: listing.variants.len(),
        options: raw_options(listing),
    };

    Record {
        product_url: product_url(base_url, &listing.handle),
        image_url,
        additional_images,
        title: listing.title.trim().to_string(),
        description,
        category: normalize_category(listing.product_type.as_deref()),
        gender: infer_gender(listing),
        price: price_string(listing),
        sale: sale_value(listing),
        size: sizes(listing),
        metadata: Some(metadata),
        tags: listing.tags.clone(),
    }
}

fn raw_options(listing: &Listing) -> JsonValue {
    let options: Vec<JsonValue> = listing
        .options
        .iter()
        .map(|option| {
            serde_json::json!({
                "name": option.name,
                "values": option.values,
            })
        })
        .collect();
    JsonValue::Array(options)
}
