use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw unit produced by a source adapter.
///
/// Records are immutable after creation and live only until the document
/// builder folds them into a [`super::Document`]. The payload is an ordered
/// mapping so that identical inputs always serialize identically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Instant the underlying event happened.
    pub timestamp: DateTime<Utc>,
    /// Short identifier of the producing source (`"chat_export"`, ...).
    pub source: String,
    /// Ordered key/value payload.
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Record {
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, source: impl Into<String>) -> Self {
        Self {
            timestamp,
            source: source.into(),
            data: BTreeMap::new(),
        }
    }

    /// Insert one payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Fetch a payload field as a string slice, if present and textual.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_access() {
        let rec = Record::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(), "notes")
            .with_field("title", "groceries")
            .with_field("lines", 3);
        assert_eq!(rec.str_field("title"), Some("groceries"));
        assert_eq!(rec.str_field("lines"), None);
        assert_eq!(rec.str_field("missing"), None);
    }

    #[test]
    fn payload_order_is_stable() {
        let rec = Record::new(Utc::now(), "s")
            .with_field("zeta", 1)
            .with_field("alpha", 2);
        let keys: Vec<_> = rec.data.keys().cloned().collect();
        assert_eq!(keys, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
