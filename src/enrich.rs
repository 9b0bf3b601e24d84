use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::EnrichError;
use crate::record::Record;

/// Derived value for one completed record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub estimated_price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    pub estimated_at: DateTime<Utc>,
}

/// Downstream estimation service. Called outside the concurrency core;
/// safe to re-invoke because results are keyed by record id.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, record: &Record) -> Result<Estimate, EnrichError>;
}

/// HTTP client for a price-estimation model endpoint. The model replies in
/// prose with the estimate wrapped in <price>...</price> tags.
pub struct HttpEnricher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEnricher {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, EnrichError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichError::Http(e.to_string()))?;
        Ok(HttpEnricher { client, endpoint })
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, record: &Record) -> Result<Estimate, EnrichError> {
        let body = json!({
            "id": record.id,
            "url": record.source_url,
            "fields": record.fields,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| EnrichError::Http(e.to_string()))?;
        let text = resp
            .text()
            .await
            .map_err(|e| EnrichError::Http(e.to_string()))?;

        let answer = model_answer(&text);
        let price = parse_price_tag(&answer).ok_or(EnrichError::MissingPrice)?;
        Ok(Estimate {
            estimated_price: price,
            raw_response: Some(answer),
            estimated_at: Utc::now(),
        })
    }
}

/// The endpoint may return either raw prose or a JSON envelope with an
/// "ai_response" field.
fn model_answer(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(s) = v.get("ai_response").and_then(|s| s.as_str()) {
            return s.to_string();
        }
    }
    body.to_string()
}

/// Pull the estimate out of <price>...</price> tags.
pub fn parse_price_tag(answer: &str) -> Option<String> {
    let re = Regex::new(r"(?s)<price>(.*?)</price>").ok()?;
    re.captures(answer)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Per-id estimates file. Existing entries are kept so re-running the pass
/// is idempotent; `force` re-estimates everything.
pub fn load_estimates(path: &Path) -> anyhow::Result<BTreeMap<String, Estimate>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn save_estimates(path: &Path, estimates: &BTreeMap<String, Estimate>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(estimates)?)?;
    Ok(())
}
