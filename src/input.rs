use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SchemaError;
use crate::record::{Record, PREVIEW_RANK};

/// One source listing as produced by the search-results scrape. Only the
/// URL is required; preview fields seed the record at the weakest rank so a
/// detail-page extraction always supersedes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputListing {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(alias = "link")]
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

pub fn load_listings(path: &Path) -> anyhow::Result<Vec<InputListing>> {
    let raw = std::fs::read_to_string(path)?;
    let listings: Vec<InputListing> = serde_json::from_str(&raw)?;
    Ok(listings)
}

/// Turn input listings into pending records: assign stable ids (a fresh
/// UUID when the source carries none), stamp origin_index, and seed preview
/// fields. Duplicate ids are rejected outright rather than letting one
/// listing's checkpoint entry silently shadow another's.
pub fn ingest(listings: Vec<InputListing>) -> Result<Vec<Record>, SchemaError> {
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(listings.len());

    for (origin_index, listing) in listings.into_iter().enumerate() {
        let id = listing
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !seen.insert(id.clone()) {
            return Err(SchemaError::DuplicateRecordId(id));
        }

        let mut record = Record::new(id, listing.url.clone(), origin_index);
        seed_preview(&mut record, &listing);
        records.push(record);
    }
    Ok(records)
}

fn seed_preview(record: &mut Record, listing: &InputListing) {
    if let Some(title) = &listing.title {
        record.set_field("title", json!(title), PREVIEW_RANK);
    }
    if let Some(price) = &listing.price {
        record.set_field("price", json!(price), PREVIEW_RANK);
    }
    if let Some(location) = &listing.location {
        record.set_field("location", json!(location), PREVIEW_RANK);
    }
    if let Some(thumb) = &listing.image_url {
        record.set_field("image_urls", Value::Array(vec![json!(thumb)]), PREVIEW_RANK);
    }
}
