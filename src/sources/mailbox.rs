//! Adapter for mbox-style mail exports.
//!
//! Messages are delimited by `From ` separator lines. Only the headers the
//! pipeline uses are parsed (`From`, `Date`, `Subject`); the rest of the
//! header block is ignored and the body is kept verbatim.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

use super::SourceAdapter;
use crate::error::PipelineError;
use crate::model::Record;

pub const KEY_FROM: &str = "from";
pub const KEY_SUBJECT: &str = "subject";
pub const KEY_BODY: &str = "body";

pub struct MailboxSource {
    header: Regex,
}

impl MailboxSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // "Name: value" at the start of a header line.
            header: Regex::new(r"^([A-Za-z-]+):\s*(.*)$").expect("static regex"),
        }
    }
}

impl Default for MailboxSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for MailboxSource {
    fn name(&self) -> &'static str {
        "mailbox"
    }

    fn process_file(&self, path: &Path) -> Result<Vec<Record>, PipelineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| PipelineError::source(self.name(), format!("{}: {err}", path.display())))?;

        let mut records = Vec::new();
        for (idx, message) in split_messages(&raw).into_iter().enumerate() {
            match self.parse_message(message) {
                Some(record) => records.push(record),
                None => warn!(
                    source = self.name(),
                    file = %path.display(),
                    index = idx,
                    "skipping malformed mail message"
                ),
            }
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

impl MailboxSource {
    fn parse_message(&self, message: &str) -> Option<Record> {
        let (headers, body) = message.split_once("\n\n")?;

        let mut from = None;
        let mut date = None;
        let mut subject = None;
        for line in headers.lines() {
            let Some(caps) = self.header.captures(line) else {
                continue;
            };
            match caps[1].to_ascii_lowercase().as_str() {
                "from" => from = Some(caps[2].trim().to_string()),
                "date" => date = Some(caps[2].trim().to_string()),
                "subject" => subject = Some(caps[2].trim().to_string()),
                _ => {}
            }
        }

        let timestamp = parse_date(date.as_deref()?)?;
        let body = body.trim();
        if body.is_empty() {
            return None;
        }
        Some(
            Record::new(timestamp, "mailbox")
                .with_field(KEY_FROM, from.unwrap_or_else(|| "unknown".to_string()))
                .with_field(KEY_SUBJECT, subject.unwrap_or_default())
                .with_field(KEY_BODY, body),
        )
    }
}

/// Split an mbox payload on `From ` separator lines.
fn split_messages(raw: &str) -> Vec<&str> {
    let mut messages = Vec::new();
    let mut start = None;
    for (offset, line) in line_offsets(raw) {
        if line.starts_with("From ") {
            if let Some(begin) = start {
                messages.push(raw[begin..offset].trim_end());
            }
            start = Some(offset);
        }
    }
    if let Some(begin) = start {
        messages.push(raw[begin..].trim_end());
    }
    messages
}

fn line_offsets(raw: &str) -> impl Iterator<Item = (usize, &str)> {
    raw.split_inclusive('\n').scan(0usize, |offset, line| {
        let here = *offset;
        *offset += line.len();
        Some((here, line.trim_end_matches('\n')))
    })
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
