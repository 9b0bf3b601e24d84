use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use scraper::Html;
use serde_json::Value;

use crate::fetcher::Document;
use crate::record::{dedup_candidates, Record, Status};
use crate::schema::{FieldKind, FieldSchema};

/// Apply the full schema to one fetched document. Every field is attempted
/// exactly once; a field whose chain is exhausted stays Absent, which is a
/// valid terminal state, not an error.
pub fn extract_record(doc: &Document, schema: &FieldSchema, record: &mut Record) {
    let dom = Html::parse_document(doc.html());

    for spec in &schema.fields {
        record.mark_attempted(&spec.name);
        if let Some((rank, value)) = spec.evaluate(&dom) {
            let value = match (spec.kind, value) {
                (FieldKind::List, Value::Array(items)) => {
                    let candidates = items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                    let key = spec.dedup_regex();
                    Value::Array(
                        dedup_candidates(candidates, key.as_ref())
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    )
                }
                (_, value) => value,
            };
            record.set_field(&spec.name, value, rank);
        }
    }

    derive_listed_date(record, Utc::now());

    record.status = Status::Complete;
    record.error = None;
    record.scraped_at = Some(doc.fetched_at());
}

/// "Listed 2 weeks ago in Auburn, AL" carries the only date the page shows;
/// turn it into a concrete ISO date next to the raw text.
fn derive_listed_date(record: &mut Record, now: DateTime<Utc>) {
    let posted = match record.field("posted_date") {
        crate::record::FieldValue::Present { value, rank } => {
            value.as_str().map(|s| (s.to_string(), *rank))
        }
        crate::record::FieldValue::Absent => None,
    };
    let Some((posted, rank)) = posted else {
        return;
    };
    record.mark_attempted("listed_date");
    if let Some(date) = parse_relative_date(&posted, now) {
        record.set_field("listed_date", Value::String(date.to_string()), rank);
    }
}

/// Resolve a relative posting date ("3 days ago", "yesterday", "a week
/// ago") against `now`. Months are approximated at 30 days.
pub fn parse_relative_date(text: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
    let text = text.to_lowercase();
    let today = now.date_naive();

    if text.contains("today") || text.contains("just now") {
        return Some(today);
    }
    if text.contains("yesterday") {
        return Some(today - Duration::days(1));
    }

    let re = Regex::new(r"(\d+)\s*(minute|hour|day|week|month)s?\s*ago").ok()?;
    if let Some(caps) = re.captures(&text) {
        let amount: i64 = caps[1].parse().ok()?;
        let delta = match &caps[2] {
            "minute" => Duration::minutes(amount),
            "hour" => Duration::hours(amount),
            "day" => Duration::days(amount),
            "week" => Duration::weeks(amount),
            "month" => Duration::days(amount * 30),
            _ => return None,
        };
        return Some((now - delta).date_naive());
    }

    // "a week ago", "an hour ago"
    let re = Regex::new(r"\ban?\s+(minute|hour|day|week|month)\s+ago").ok()?;
    if let Some(caps) = re.captures(&text) {
        let delta = match &caps[1] {
            "minute" => Duration::minutes(1),
            "hour" => Duration::hours(1),
            "day" => Duration::days(1),
            "week" => Duration::weeks(1),
            "month" => Duration::days(30),
            _ => return None,
        };
        return Some((now - delta).date_naive());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::record::{FieldValue, PREVIEW_RANK};

    fn doc(html: &str) -> Document {
        Document::new("https://example.test/listing/1".into(), 200, html.into())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn relative_dates_resolve() {
        let n = now();
        assert_eq!(
            parse_relative_date("Listed today in Auburn, AL", n),
            Some(NaiveDate::from_ymd_opt(2026, 3, 15).unwrap())
        );
        assert_eq!(
            parse_relative_date("Listed yesterday", n),
            Some(NaiveDate::from_ymd_opt(2026, 3, 14).unwrap())
        );
        assert_eq!(
            parse_relative_date("Listed 2 weeks ago in Auburn, AL", n),
            Some(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
        );
        assert_eq!(
            parse_relative_date("Listed a month ago", n),
            Some(NaiveDate::from_ymd_opt(2026, 2, 13).unwrap())
        );
        assert_eq!(
            parse_relative_date("Listed 3 hours ago", n),
            Some(NaiveDate::from_ymd_opt(2026, 3, 15).unwrap())
        );
        assert_eq!(parse_relative_date("N/A", n), None);
    }

    #[test]
    fn every_schema_field_is_attempted() {
        let schema = FieldSchema::default();
        let mut rec = Record::new("r1".into(), "u1".into(), 0);
        extract_record(&doc("<p>empty page</p>"), &schema, &mut rec);

        assert_eq!(rec.status, Status::Complete);
        for name in schema.field_names() {
            assert!(rec.fields.contains_key(&name), "missing field {name}");
        }
        assert_eq!(rec.field("title"), &FieldValue::Absent);
    }

    #[test]
    fn extraction_outranks_preview_seed() {
        let schema = FieldSchema::default();
        let mut rec = Record::new("r1".into(), "u1".into(), 0);
        rec.set_field("title", serde_json::json!("preview title"), PREVIEW_RANK);
        rec.set_field("condition", serde_json::json!("Used"), PREVIEW_RANK);

        extract_record(
            &doc("<h1><span>Trek Bike</span></h1>"),
            &schema,
            &mut rec,
        );

        // extracted title wins; untouched preview value survives
        assert_eq!(rec.field("title").as_str(), Some("Trek Bike"));
        assert_eq!(rec.field("condition").as_str(), Some("Used"));
    }

    #[test]
    fn image_list_dedups_by_identity_key() {
        let schema = FieldSchema::default();
        let html = r#"
            <img src="https://scontent.test/v/123_456.jpg?stp=a">
            <img src="https://scontent.test/v/789_012.jpg">
            <img src="https://scontent.test/v/123_456.jpg?stp=b">
        "#;
        let mut rec = Record::new("r1".into(), "u1".into(), 0);
        extract_record(&doc(html), &schema, &mut rec);

        match rec.field("image_urls") {
            FieldValue::Present { value, rank } => {
                assert_eq!(*rank, 1);
                assert_eq!(value.as_array().unwrap().len(), 2);
            }
            FieldValue::Absent => panic!("expected images"),
        }
    }

    #[test]
    fn listed_date_derives_from_posted_date() {
        let schema = FieldSchema::default();
        let html = "<div><span>Listed 2 days ago in Auburn, AL</span></div>";
        let mut rec = Record::new("r1".into(), "u1".into(), 0);
        extract_record(&doc(html), &schema, &mut rec);

        assert_eq!(
            rec.field("posted_date").as_str(),
            Some("Listed 2 days ago in Auburn, AL")
        );
        assert_eq!(rec.field("location").as_str(), Some("Auburn, AL"));
        assert!(rec.field("listed_date").is_present());
    }
}
