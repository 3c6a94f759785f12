//! Record normalization applied between fetch and load.
//!
//! Per record, in order:
//! 1. rename fields per the descriptor's `field_mappings`
//! 2. unwrap `{"$oid": ...}` primary keys to plain strings
//! 3. serialize `json_fields` to JSON text, defaulting missing/null ones to `"[]"`
//! 4. stamp the origin field
//! 5. turn empty strings into null
//! 6. normalize date fields to ISO-8601 instants (null when unparseable or
//!    outside 1900..=2100); the audit timestamps default to "now"

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::MigrationOptions;
use crate::registry::CollectionDescriptor;
use crate::source::Record;

/// Default stored for a JSON field that is missing or null.
pub const EMPTY_JSON_ARRAY: &str = "[]";

/// Earliest year accepted for a date value.
pub const MIN_YEAR: i32 = 1900;

/// Latest year accepted for a date value.
pub const MAX_YEAR: i32 = 2100;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// Per-collection record transformer.
#[derive(Debug, Clone)]
pub struct Transformer {
    primary_key: String,
    field_mappings: BTreeMap<String, String>,
    json_fields: BTreeSet<String>,
    date_fields: BTreeSet<String>,
    origin_field: String,
    origin_tag: String,
    created_field: String,
    updated_field: String,
}

impl Transformer {
    /// Creates the transformer for one collection.
    pub fn new(descriptor: &CollectionDescriptor, options: &MigrationOptions) -> Self {
        let mut date_fields = descriptor.date_fields.clone();
        date_fields.insert(options.created_field.clone());
        date_fields.insert(options.updated_field.clone());

        Self {
            primary_key: descriptor.primary_key.clone(),
            field_mappings: descriptor.field_mappings.clone(),
            json_fields: descriptor.json_fields.clone(),
            date_fields,
            origin_field: options.origin_field.clone(),
            origin_tag: options.origin_tag.clone(),
            created_field: options.created_field.clone(),
            updated_field: options.updated_field.clone(),
        }
    }

    /// Transforms one record, using the current time for missing audit timestamps.
    pub fn transform(&self, record: Record) -> Record {
        self.transform_at(record, Utc::now())
    }

    /// Transforms one record with an explicit "now".
    pub fn transform_at(&self, mut record: Record, now: DateTime<Utc>) -> Record {
        for (from, to) in &self.field_mappings {
            if let Some(value) = record.remove(from) {
                record.insert(to.clone(), value);
            }
        }

        if let Some(id) = record.get_mut(&self.primary_key) {
            unwrap_object_id(id);
        }

        for field in &self.json_fields {
            let serialized = match record.get(field) {
                None | Some(Value::Null) => Value::String(EMPTY_JSON_ARRAY.to_string()),
                Some(value @ (Value::Object(_) | Value::Array(_))) => {
                    Value::String(value.to_string())
                }
                Some(other) => other.clone(),
            };
            record.insert(field.clone(), serialized);
        }

        record.insert(
            self.origin_field.clone(),
            Value::String(self.origin_tag.clone()),
        );

        for value in record.values_mut() {
            if matches!(value, Value::String(s) if s.is_empty()) {
                *value = Value::Null;
            }
        }

        for field in &self.date_fields {
            if let Some(value) = record.get_mut(field) {
                *value = normalize_date(value);
            }
        }

        let now = Value::String(format_instant(&now));
        for audit in [&self.created_field, &self.updated_field] {
            if matches!(record.get(audit), None | Some(Value::Null)) {
                record.insert(audit.clone(), now.clone());
            }
        }

        record
    }

    /// Transforms a page of records.
    pub fn transform_batch(&self, records: Vec<Record>) -> Vec<Record> {
        let now = Utc::now();
        records
            .into_iter()
            .map(|record| self.transform_at(record, now))
            .collect()
    }
}

/// Replaces `{"$oid": "..."}` with the bare id string.
fn unwrap_object_id(id: &mut Value) {
    let oid = match id {
        Value::Object(map) => map.get("$oid").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    if let Some(oid) = oid {
        *id = Value::String(oid);
    }
}

/// Parses a date-like value into a UTC instant.
///
/// Accepts RFC 3339 strings, naive date-times and dates (read as UTC), epoch
/// milliseconds, and `{"$date": ...}` wrappers around any of those.
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_date_str(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::Object(map) => map.get("$date").and_then(parse_date),
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    for format in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Normalizes a date-like value to a canonical ISO-8601 instant, or null.
pub fn normalize_date(value: &Value) -> Value {
    match parse_date(value) {
        Some(dt) if (MIN_YEAR..=MAX_YEAR).contains(&dt.year()) => {
            Value::String(format_instant(&dt))
        }
        _ => Value::Null,
    }
}

/// `2024-03-01T12:00:00.000Z`
fn format_instant(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
#[path = "transform_tests.rs"]
mod tests;
