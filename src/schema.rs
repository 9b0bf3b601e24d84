use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{SchemaError, StrategyError};

/// One extraction attempt: a pure query over the parsed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    /// CSS selector; yields the first match's attribute (or text when no
    /// attribute is named). List fields collect every match.
    Css {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attr: Option<String>,
    },
    /// Regex over the page's visible text, yielding one capture group.
    TextPattern {
        pattern: String,
        #[serde(default = "default_group")]
        group: usize,
    },
}

fn default_group() -> usize {
    1
}

impl Strategy {
    fn first(&self, dom: &Html) -> Result<Option<String>, StrategyError> {
        match self {
            Strategy::Css { selector, attr } => {
                let sel = parse_selector(selector)?;
                for el in dom.select(&sel) {
                    if let Some(v) = element_value(el, attr.as_deref()) {
                        return Ok(Some(v));
                    }
                }
                Ok(None)
            }
            Strategy::TextPattern { pattern, group } => {
                let re = parse_pattern(pattern)?;
                let text = page_text(dom);
                Ok(re
                    .captures(&text)
                    .and_then(|c| c.get(*group))
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|s| !s.is_empty()))
            }
        }
    }

    fn all(&self, dom: &Html) -> Result<Vec<String>, StrategyError> {
        match self {
            Strategy::Css { selector, attr } => {
                let sel = parse_selector(selector)?;
                Ok(dom
                    .select(&sel)
                    .filter_map(|el| element_value(el, attr.as_deref()))
                    .collect())
            }
            Strategy::TextPattern { pattern, group } => {
                let re = parse_pattern(pattern)?;
                let text = page_text(dom);
                Ok(re
                    .captures_iter(&text)
                    .filter_map(|c| c.get(*group))
                    .map(|m| m.as_str().trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect())
            }
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, StrategyError> {
    Selector::parse(selector).map_err(|e| StrategyError(format!("selector '{selector}': {e}")))
}

fn parse_pattern(pattern: &str) -> Result<Regex, StrategyError> {
    Regex::new(pattern).map_err(|e| StrategyError(format!("pattern '{pattern}': {e}")))
}

fn element_value(el: ElementRef, attr: Option<&str>) -> Option<String> {
    let v = match attr {
        Some(a) => el.value().attr(a)?.trim().to_string(),
        None => el.text().collect::<String>().trim().to_string(),
    };
    if v.is_empty() { None } else { Some(v) }
}

fn page_text(dom: &Html) -> String {
    dom.root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Scalar,
    List,
}

/// One field of the schema: a name and its ordered fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    pub strategies: Vec<Strategy>,
    /// Identity-key pattern for list dedup (first capture group).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl FieldSpec {
    /// Walk the chain in order, stopping at the first strategy that yields a
    /// value. A failing strategy counts as a miss, logged at debug only.
    pub fn evaluate(&self, dom: &Html) -> Option<(usize, Value)> {
        for (i, strategy) in self.strategies.iter().enumerate() {
            let rank = i + 1;
            let hit = match self.kind {
                FieldKind::Scalar => strategy.first(dom).map(|v| v.map(Value::String)),
                FieldKind::List => strategy.all(dom).map(|vs| {
                    if vs.is_empty() {
                        None
                    } else {
                        Some(Value::Array(vs.into_iter().map(Value::String).collect()))
                    }
                }),
            };
            match hit {
                Ok(Some(value)) => return Some((rank, value)),
                Ok(None) => {}
                Err(e) => debug!(field = %self.name, rank, "{}", e),
            }
        }
        None
    }

    pub fn dedup_regex(&self) -> Option<Regex> {
        self.dedup_key.as_deref().and_then(|p| Regex::new(p).ok())
    }
}

/// The full field schema: what to extract and how, supplied as
/// configuration so it can evolve without touching the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub fields: Vec<FieldSpec>,
}

impl FieldSchema {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let schema: FieldSchema = serde_json::from_str(&raw)?;
        Ok(schema)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Refuse to run on a malformed schema: empty chains, duplicate names,
    /// or strategies that can never compile.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::Empty);
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.fields {
            if !seen.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateField(spec.name.clone()));
            }
            if spec.strategies.is_empty() {
                return Err(SchemaError::EmptyChain(spec.name.clone()));
            }
            for strategy in &spec.strategies {
                match strategy {
                    Strategy::Css { selector, .. } => {
                        if Selector::parse(selector).is_err() {
                            return Err(SchemaError::BadSelector {
                                field: spec.name.clone(),
                                selector: selector.clone(),
                            });
                        }
                    }
                    Strategy::TextPattern { pattern, .. } => {
                        if let Err(source) = Regex::new(pattern) {
                            return Err(SchemaError::BadPattern {
                                field: spec.name.clone(),
                                pattern: pattern.clone(),
                                source,
                            });
                        }
                    }
                }
            }
            if let Some(p) = &spec.dedup_key {
                if let Err(source) = Regex::new(p) {
                    return Err(SchemaError::BadPattern {
                        field: spec.name.clone(),
                        pattern: p.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for FieldSchema {
    /// Built-in marketplace listing schema. Selectors mirror what detail
    /// pages expose today; override with --schema when the site shifts.
    fn default() -> Self {
        let css = |selector: &str| Strategy::Css {
            selector: selector.to_string(),
            attr: None,
        };
        let css_attr = |selector: &str, attr: &str| Strategy::Css {
            selector: selector.to_string(),
            attr: Some(attr.to_string()),
        };
        let text = |pattern: &str| Strategy::TextPattern {
            pattern: pattern.to_string(),
            group: 1,
        };
        let scalar = |name: &str, strategies: Vec<Strategy>| FieldSpec {
            name: name.to_string(),
            kind: FieldKind::Scalar,
            strategies,
            dedup_key: None,
        };

        FieldSchema {
            fields: vec![
                scalar(
                    "title",
                    vec![
                        css("h1 span"),
                        css("div[role=\"heading\"] span"),
                        css_attr("meta[property=\"og:title\"]", "content"),
                    ],
                ),
                scalar(
                    "price",
                    vec![
                        css_attr("meta[property=\"product:price:amount\"]", "content"),
                        css("span[data-testid=\"listing-price\"]"),
                        text(r"(\$\s?\d[\d,]*(?:\.\d{2})?)"),
                    ],
                ),
                scalar(
                    "description",
                    vec![
                        css_attr("meta[property=\"og:description\"]", "content"),
                        css("div[data-testid=\"listing-description\"]"),
                    ],
                ),
                scalar(
                    "condition",
                    vec![text(
                        r"(?m)^(New(?: with(?:out)? (?:tags|box))?|Used(?: - (?:Like new|Good|Fair|Acceptable))?|Like new|Refurbished|Pre-owned|For parts(?: or not working)?)$",
                    )],
                ),
                scalar("posted_date", vec![text(r"(Listed [^\n]+)")]),
                scalar("location", vec![text(r"Listed [^\n]* in ([^\n]+)")]),
                scalar(
                    "availability",
                    vec![text(r"(?m)^(Available|Sold|Pending)$")],
                ),
                FieldSpec {
                    name: "image_urls".to_string(),
                    kind: FieldKind::List,
                    strategies: vec![
                        css_attr("img[src*=\"scontent\"]", "src"),
                        css_attr("link[rel=\"preload\"][as=\"image\"]", "href"),
                    ],
                    dedup_key: Some(r"(\d+_\d+)".to_string()),
                },
            ],
        }
    }
}
