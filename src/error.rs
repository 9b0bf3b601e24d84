use std::time::Duration;

use thiserror::Error;

/// The page could not be retrieved at all. Always terminal for the record,
/// never for the run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("http status {0}")]
    Http(u16),
    #[error("network: {0}")]
    Network(String),
    #[error("navigation: {0}")]
    Navigation(String),
}

// Timeouts are classified by `HttpFetcher`, which knows the configured
// duration; everything else maps here.
impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            FetchError::Http(status.as_u16())
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

/// A single extraction strategy failed internally (bad selector or pattern
/// at evaluation time). Treated as a miss, logged at debug only.
#[derive(Debug, Error)]
#[error("strategy failed: {0}")]
pub struct StrategyError(pub String);

/// The field schema or the input itself is malformed. Fatal before any
/// fetching starts.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema has no fields")]
    Empty,
    #[error("field '{0}' has an empty strategy chain")]
    EmptyChain(String),
    #[error("duplicate field '{0}' in schema")]
    DuplicateField(String),
    #[error("invalid selector '{selector}' for field '{field}'")]
    BadSelector { field: String, selector: String },
    #[error("invalid pattern '{pattern}' for field '{field}': {source}")]
    BadPattern {
        field: String,
        pattern: String,
        source: regex::Error,
    },
    #[error("duplicate record id '{0}' in input")]
    DuplicateRecordId(String),
}

/// Durable checkpoint write or replay failed. Fatal for the run after
/// bounded retries; data durability is a correctness property.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The downstream estimation service failed for one record.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("estimation request failed: {0}")]
    Http(String),
    #[error("no price tag in estimation response")]
    MissingPrice,
}
