//! Canonical log record and open-schema normalization
//!
//! A record is decoded in two passes: first into the fixed shape
//! (`timestamp`, `level`, `message`, `labels`), then as a generic JSON
//! object whose remaining top-level keys are folded into `labels`.
//!
//! Folding coerces values to text:
//! - string: unchanged
//! - number: decimal text (`42`, `1.5`)
//! - boolean: `true` / `false`
//! - null: key skipped
//! - array / object: compact JSON text
//!
//! Entries already nested under `labels` win over folded top-level keys.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Top-level fields that are part of the fixed record shape
pub const RESERVED_FIELDS: [&str; 4] = ["timestamp", "level", "message", "labels"];

/// A single immutable log record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("log record must be a JSON object")]
    NotAnObject,
}

/// First decode pass: the fixed part of the wire format
#[derive(Deserialize)]
struct FixedShape {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    labels: Option<Map<String, Value>>,
}

impl LogRecord {
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: DateTime::<Utc>::default(),
            level: level.into(),
            message: message.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decode a wire payload, applying the open-schema folding rule
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, RecordError> {
        let Value::Object(fields) = value else {
            return Err(RecordError::NotAnObject);
        };

        let fixed: FixedShape = serde_json::from_value(Value::Object(fields.clone()))?;

        let mut labels = BTreeMap::new();
        for (key, value) in fixed.labels.unwrap_or_default() {
            if let Some(text) = coerce_label_value(&value) {
                labels.insert(key, text);
            }
        }

        for (key, value) in &fields {
            if RESERVED_FIELDS.contains(&key.as_str()) || labels.contains_key(key) {
                continue;
            }
            if let Some(text) = coerce_label_value(value) {
                labels.insert(key.clone(), text);
            }
        }

        Ok(Self {
            timestamp: fixed.timestamp.unwrap_or_default(),
            level: fixed.level.unwrap_or_default(),
            message: fixed.message.unwrap_or_default(),
            labels,
        })
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// True for absent, epoch, or year-1 ("zero value") timestamps
    pub fn has_zero_timestamp(&self) -> bool {
        let ts = self.timestamp;
        (ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0) || ts.year() <= 1
    }

    /// Replace a zero timestamp with `now`. Returns whether it was replaced.
    pub fn ensure_timestamp(&mut self, now: DateTime<Utc>) -> bool {
        if self.has_zero_timestamp() {
            self.timestamp = now;
            true
        } else {
            false
        }
    }
}

impl<'de> Deserialize<'de> for LogRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        LogRecord::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Textual form of a label value, or `None` when the value is null
pub fn coerce_label_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_standard_fields_only() {
        let json = r#"{"level":"info", "message":"test", "timestamp":"2023-01-01T00:00:00Z"}"#;
        let record = LogRecord::from_slice(json.as_bytes()).unwrap();

        assert_eq!(record.level, "info");
        assert_eq!(record.message, "test");
        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        assert!(record.labels.is_empty());
    }

    #[test]
    fn test_nested_labels_preserved() {
        let json = r#"{"level":"info", "message":"test", "labels":{"service":"auth"}}"#;
        let record = LogRecord::from_slice(json.as_bytes()).unwrap();
        assert_eq!(record.labels, labels(&[("service", "auth")]));
    }

    #[test]
    fn test_top_level_field_folded_into_labels() {
        let json = r#"{"level":"info", "message":"test", "service":"auth"}"#;
        let record = LogRecord::from_slice(json.as_bytes()).unwrap();
        assert_eq!(record.labels, labels(&[("service", "auth")]));
    }

    #[test]
    fn test_nested_and_top_level_merge() {
        let json = r#"{"level":"info", "message":"test", "labels":{"env":"prod"}, "service":"auth"}"#;
        let record = LogRecord::from_slice(json.as_bytes()).unwrap();
        assert_eq!(record.labels, labels(&[("env", "prod"), ("service", "auth")]));
    }

    #[test]
    fn test_nested_label_wins_over_top_level_duplicate() {
        let json = r#"{"level":"info", "labels":{"service":"auth"}, "service":"billing"}"#;
        let record = LogRecord::from_slice(json.as_bytes()).unwrap();
        assert_eq!(record.labels, labels(&[("service", "auth")]));
    }

    #[test]
    fn test_coercion_of_non_string_values() {
        let json = r#"{
            "level": "warn",
            "status": 503,
            "ratio": 1.5,
            "retry": true,
            "ignored": null,
            "tags": ["a", "b"],
            "ctx": {"user": 7}
        }"#;
        let record = LogRecord::from_slice(json.as_bytes()).unwrap();

        assert_eq!(record.labels.get("status").map(String::as_str), Some("503"));
        assert_eq!(record.labels.get("ratio").map(String::as_str), Some("1.5"));
        assert_eq!(record.labels.get("retry").map(String::as_str), Some("true"));
        assert_eq!(record.labels.get("tags").map(String::as_str), Some(r#"["a","b"]"#));
        assert_eq!(record.labels.get("ctx").map(String::as_str), Some(r#"{"user":7}"#));
        assert!(!record.labels.contains_key("ignored"));
    }

    #[test]
    fn test_labels_never_absent_after_serialization() {
        let record = LogRecord::from_slice(br#"{"level":"info"}"#).unwrap();
        let value: Value = serde_json::from_slice(&record.to_json_vec().unwrap()).unwrap();
        assert_eq!(value["labels"], serde_json::json!({}));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert!(LogRecord::from_slice(b"not json").is_err());
        assert!(matches!(
            LogRecord::from_slice(b"[1,2,3]"),
            Err(RecordError::NotAnObject)
        ));
        assert!(LogRecord::from_slice(br#"{"labels":"oops"}"#).is_err());
        assert!(LogRecord::from_slice(br#"{"level":5}"#).is_err());
        assert!(LogRecord::from_slice(br#"{"timestamp":"yesterday"}"#).is_err());
    }

    #[test]
    fn test_zero_timestamp_replaced() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let mut absent = LogRecord::from_slice(br#"{"level":"info"}"#).unwrap();
        assert!(absent.has_zero_timestamp());
        assert!(absent.ensure_timestamp(now));
        assert_eq!(absent.timestamp, now);

        let mut go_zero =
            LogRecord::from_slice(br#"{"timestamp":"0001-01-01T00:00:00Z"}"#).unwrap();
        assert!(go_zero.ensure_timestamp(now));
        assert_eq!(go_zero.timestamp, now);
    }

    #[test]
    fn test_non_zero_timestamp_preserved_exactly() {
        let json = r#"{"timestamp":"2023-05-06T07:08:09.123456789Z","level":"info"}"#;
        let mut record = LogRecord::from_slice(json.as_bytes()).unwrap();
        let original = record.timestamp;

        assert!(!record.ensure_timestamp(Utc::now()));
        assert_eq!(record.timestamp, original);

        let decoded = LogRecord::from_slice(&record.to_json_vec().unwrap()).unwrap();
        assert_eq!(decoded.timestamp, original);
    }

    #[test]
    fn test_serde_deserialize_applies_folding() {
        let record: LogRecord =
            serde_json::from_str(r#"{"level":"error","region":"eu-west-1"}"#).unwrap();
        assert_eq!(record.labels, labels(&[("region", "eu-west-1")]));
    }
}
