//! Adapter for JSON chat exports.
//!
//! Accepts either a bare JSON array of message objects or an object with a
//! top-level `messages` array. Field names are tolerant of the common
//! variants exporters use (`conversation_id`/`chat_id`, `sender`/`from`,
//! `text`/`message`/`content`, RFC 3339 or epoch-seconds timestamps).

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::warn;

use super::SourceAdapter;
use crate::error::PipelineError;
use crate::model::Record;

/// Payload keys this adapter emits on every record.
pub const KEY_CONVERSATION: &str = "conversation_id";
pub const KEY_SENDER: &str = "sender";
pub const KEY_TEXT: &str = "text";
pub const KEY_SEQ: &str = "seq";

#[derive(Deserialize)]
struct WireMessage {
    #[serde(alias = "chat_id", alias = "thread")]
    conversation_id: Option<String>,
    #[serde(alias = "from", alias = "author")]
    sender: Option<String>,
    #[serde(alias = "message", alias = "content")]
    text: Option<String>,
    timestamp: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireExport {
    Array(Vec<serde_json::Value>),
    Object { messages: Vec<serde_json::Value> },
}

pub struct ChatExportSource;

impl ChatExportSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for ChatExportSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for ChatExportSource {
    fn name(&self) -> &'static str {
        "chat_export"
    }

    fn process_file(&self, path: &Path) -> Result<Vec<Record>, PipelineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::source(self.name(), format!("{}: {err}", path.display())))?;
        let export: WireExport = serde_json::from_str(&raw)
            .map_err(|err| PipelineError::source(self.name(), format!("{}: {err}", path.display())))?;
        let messages = match export {
            WireExport::Array(messages) | WireExport::Object { messages } => messages,
        };

        let mut records = Vec::with_capacity(messages.len());
        for (idx, value) in messages.into_iter().enumerate() {
            match parse_message(&value, idx) {
                Some(record) => records.push(record),
                None => {
                    warn!(
                        source = self.name(),
                        file = %path.display(),
                        index = idx,
                        "skipping malformed chat message"
                    );
                }
            }
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

fn parse_message(value: &serde_json::Value, seq: usize) -> Option<Record> {
    let wire: WireMessage = serde_json::from_value(value.clone()).ok()?;
    let text = wire.text.filter(|t| !t.trim().is_empty())?;
    let timestamp = wire.timestamp.as_ref().and_then(parse_timestamp)?;
    Some(
        Record::new(timestamp, "chat_export")
            .with_field(
                KEY_CONVERSATION,
                wire.conversation_id.unwrap_or_else(|| "default".to_string()),
            )
            .with_field(KEY_SENDER, wire.sender.unwrap_or_else(|| "unknown".to_string()))
            .with_field(KEY_TEXT, text)
            .with_field(KEY_SEQ, seq as u64),
    )
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(num) => {
            let secs = num.as_i64()?;
            Utc.timestamp_opt(secs, 0).single()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_export(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_array_export_sorted_by_time() {
        let file = write_export(
            r#"[
                {"chat_id": "c1", "from": "bob", "text": "later", "timestamp": "2024-05-01T12:00:00Z"},
                {"chat_id": "c1", "from": "alice", "text": "earlier", "timestamp": "2024-05-01T09:00:00Z"}
            ]"#,
        );
        let records = ChatExportSource::new().process_file(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].str_field(KEY_SENDER), Some("alice"));
        assert_eq!(records[1].str_field(KEY_SENDER), Some("bob"));
        assert!(records[0].timestamp < records[1].timestamp);
    }

    #[test]
    fn skips_malformed_messages() {
        let file = write_export(
            r#"{"messages": [
                {"sender": "alice", "text": "no timestamp"},
                {"sender": "bob", "text": "kept", "timestamp": 1714557600},
                {"sender": "carol", "timestamp": "2024-05-01T09:00:00Z"}
            ]}"#,
        );
        let records = ChatExportSource::new().process_file(file.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].str_field(KEY_TEXT), Some("kept"));
        assert_eq!(records[0].str_field(KEY_CONVERSATION), Some("default"));
    }

    #[test]
    fn unreadable_file_is_a_source_error() {
        let err = ChatExportSource::new()
            .process_file(Path::new("/definitely/not/here.json"))
            .unwrap_err();
        assert_eq!(err.kind(), "source");
    }

    #[test]
    fn determinism_on_reparse() {
        let file = write_export(
            r#"[{"chat_id": "c", "from": "a", "text": "x", "timestamp": 1714557600}]"#,
        );
        let first = ChatExportSource::new().process_file(file.path()).unwrap();
        let second = ChatExportSource::new().process_file(file.path()).unwrap();
        assert_eq!(first, second);
    }
}
