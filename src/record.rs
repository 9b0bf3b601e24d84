use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rank assigned to values seeded from search-result previews. Weaker than
/// any strategy in a chain, so a detail-page extraction always wins but a
/// preview still fills gaps.
pub const PREVIEW_RANK: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// A field is either present with the rank of the strategy that produced it
/// (1 = most specific) or absent after the chain was exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FieldValue {
    Present { value: Value, rank: usize },
    Absent,
}

impl FieldValue {
    pub fn is_present(&self) -> bool {
        matches!(self, FieldValue::Present { .. })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Present { value, .. } => value.as_str(),
            FieldValue::Absent => None,
        }
    }
}

/// One unit of enrichable work and its accumulated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub source_url: String,
    /// Position in the original input sequence; restores output order after
    /// out-of-order completion.
    pub origin_index: usize,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(id: String, source_url: String, origin_index: usize) -> Self {
        Record {
            id,
            source_url,
            origin_index,
            fields: BTreeMap::new(),
            status: Status::Pending,
            error: None,
            scraped_at: None,
        }
    }

    pub fn field(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&FieldValue::Absent)
    }

    /// Merge a candidate value in. A present field is only replaced by a
    /// strictly stronger (lower) rank; absence is always filled.
    pub fn set_field(&mut self, name: &str, value: Value, rank: usize) {
        match self.fields.get(name) {
            Some(FieldValue::Present { rank: existing, .. }) if *existing <= rank => {}
            _ => {
                self.fields
                    .insert(name.to_string(), FieldValue::Present { value, rank });
            }
        }
    }

    /// Record that a field was attempted and exhausted its chain. Does not
    /// disturb a value that is already present.
    pub fn mark_attempted(&mut self, name: &str) {
        self.fields
            .entry(name.to_string())
            .or_insert(FieldValue::Absent);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = Status::Failed;
        self.error = Some(error);
        self.scraped_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, Status::Complete | Status::Failed)
    }
}

/// Reduce a candidate list by a stable identity key, keeping first-seen
/// order and dropping later duplicates. The key is the pattern's first
/// capture group (whole match if there is none); values the pattern does not
/// match fall back to the value itself minus any query string.
pub fn dedup_candidates(values: Vec<String>, key: Option<&Regex>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for v in values {
        let k = identity_key(&v, key);
        if seen.insert(k) {
            out.push(v);
        }
    }
    out
}

fn identity_key(value: &str, key: Option<&Regex>) -> String {
    if let Some(re) = key {
        if let Some(caps) = re.captures(value) {
            let m = caps.get(1).or_else(|| caps.get(0));
            if let Some(m) = m {
                return m.as_str().to_string();
            }
        }
    }
    value.split('?').next().unwrap_or(value).to_string()
}
