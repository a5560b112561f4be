//! Document builder: folds related records into typed documents.
//!
//! Grouping rules are registered per source. Conversational sources merge
//! records that share a conversation key, order turns by timestamp (with
//! in-source position, then a stable payload hash, as tie-breaks), and
//! aggregate participants. File-like sources map one record to one Text
//! document keyed by content hash, so re-ingest of identical input
//! produces identical ids.

use std::hash::{Hash, Hasher};

use md5::{Digest, Md5};
use rustc_hash::{FxHashMap, FxHasher};
use tracing::warn;

use crate::model::{Document, Record, Turn};

/// Resolves the calling user's identity per source.
///
/// An explicit value object rather than process-global state; the owner
/// constructs it once and hands it to the builder.
#[derive(Clone, Debug)]
pub struct UsernameResolver {
    by_source: FxHashMap<String, String>,
    fallback: String,
}

impl Default for UsernameResolver {
    fn default() -> Self {
        Self {
            by_source: FxHashMap::default(),
            fallback: "me".to_string(),
        }
    }
}

impl UsernameResolver {
    #[must_use]
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            by_source: FxHashMap::default(),
            fallback: fallback.into(),
        }
    }

    #[must_use]
    pub fn with_identity(mut self, source: impl Into<String>, user: impl Into<String>) -> Self {
        self.by_source.insert(source.into(), user.into());
        self
    }

    #[must_use]
    pub fn resolve(&self, source: &str) -> &str {
        self.by_source
            .get(source)
            .map_or(self.fallback.as_str(), String::as_str)
    }
}

/// How records of one source fold into documents.
#[derive(Clone, Debug)]
pub enum GroupingRule {
    /// Merge records sharing `key_field` into one Conversation document.
    Conversation {
        key_field: &'static str,
        sender_field: &'static str,
        text_field: &'static str,
        /// Optional in-source position field used as the first tie-break.
        seq_field: Option<&'static str>,
    },
    /// One record becomes one Text document; `text_field` carries the
    /// content, `title_field` (if present) lands in metadata.
    FilePerDocument {
        text_field: &'static str,
        title_field: Option<&'static str>,
    },
}

/// Folds [`Record`]s into [`Document`]s per registered rules.
#[derive(Clone, Default)]
pub struct DocumentBuilder {
    rules: FxHashMap<String, GroupingRule>,
    resolver: UsernameResolver,
}

impl DocumentBuilder {
    #[must_use]
    pub fn new(resolver: UsernameResolver) -> Self {
        Self {
            rules: FxHashMap::default(),
            resolver,
        }
    }

    /// Builder with rules for every source the crate ships.
    #[must_use]
    pub fn with_defaults(resolver: UsernameResolver) -> Self {
        let mut builder = Self::new(resolver);
        builder.register_rule(
            "chat_export",
            GroupingRule::Conversation {
                key_field: crate::sources::chat_export::KEY_CONVERSATION,
                sender_field: crate::sources::chat_export::KEY_SENDER,
                text_field: crate::sources::chat_export::KEY_TEXT,
                seq_field: Some(crate::sources::chat_export::KEY_SEQ),
            },
        );
        builder.register_rule(
            "mailbox",
            GroupingRule::FilePerDocument {
                text_field: crate::sources::mailbox::KEY_BODY,
                title_field: Some(crate::sources::mailbox::KEY_SUBJECT),
            },
        );
        builder.register_rule(
            "notes",
            GroupingRule::FilePerDocument {
                text_field: crate::sources::notes::KEY_CONTENT,
                title_field: Some(crate::sources::notes::KEY_TITLE),
            },
        );
        builder
    }

    pub fn register_rule(&mut self, source: impl Into<String>, rule: GroupingRule) {
        self.rules.insert(source.into(), rule);
    }

    /// Fold `records` into documents. Records from sources without a
    /// registered rule are dropped with a warning; output is ordered by
    /// document timestamp, then id, for determinism.
    #[must_use]
    pub fn build(&self, records: Vec<Record>) -> Vec<Document> {
        let mut conversations: FxHashMap<String, Vec<(usize, Record)>> = FxHashMap::default();
        let mut documents = Vec::new();

        for (position, record) in records.into_iter().enumerate() {
            let Some(rule) = self.rules.get(&record.source) else {
                warn!(source = %record.source, "no grouping rule registered, dropping record");
                continue;
            };
            match rule {
                GroupingRule::Conversation { key_field, .. } => {
                    let key = record
                        .str_field(key_field)
                        .unwrap_or("default")
                        .to_string();
                    conversations
                        .entry(format!("{}:{key}", record.source))
                        .or_default()
                        .push((position, record));
                }
                GroupingRule::FilePerDocument {
                    text_field,
                    title_field,
                } => {
                    if let Some(doc) = self.build_text(&record, text_field, *title_field) {
                        documents.push(doc);
                    }
                }
            }
        }

        for (doc_id, mut members) in conversations {
            let source = members[0].1.source.clone();
            let Some(GroupingRule::Conversation {
                sender_field,
                text_field,
                seq_field,
                ..
            }) = self.rules.get(&source)
            else {
                continue;
            };

            members.sort_by_key(|(position, record)| {
                let seq = seq_field
                    .and_then(|f| record.data.get(f))
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(*position as u64);
                (record.timestamp, seq, payload_hash(record))
            });

            let user = self.resolver.resolve(&source).to_string();
            let mut people = Vec::new();
            let mut turns = Vec::with_capacity(members.len());
            for (_, record) in &members {
                let speaker = record.str_field(sender_field).unwrap_or("unknown").to_string();
                if speaker != user && !people.contains(&speaker) {
                    people.push(speaker.clone());
                }
                let content = record.str_field(text_field).unwrap_or_default().to_string();
                turns.push(Turn::new(speaker, record.timestamp, content));
            }

            let timestamp = members[0].1.timestamp;
            let mut doc = Document::conversation(doc_id, source, timestamp, user, people, turns);
            if let Some(list) = doc.people_list() {
                doc = doc.with_metadata("people", list);
            }
            documents.push(doc);
        }

        documents.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        documents
    }

    fn build_text(
        &self,
        record: &Record,
        text_field: &str,
        title_field: Option<&str>,
    ) -> Option<Document> {
        let content = record.str_field(text_field)?;
        if content.trim().is_empty() {
            return None;
        }
        let id = format!("{}:{}", record.source, content_digest(content));
        let mut doc = Document::text(id, record.source.clone(), record.timestamp, content);
        if let Some(title) = title_field.and_then(|f| record.str_field(f)) {
            if !title.is_empty() {
                doc = doc.with_metadata("title", title);
            }
        }
        Some(doc)
    }
}

/// Stable hash of a record payload, the last tie-break for identical
/// timestamps without an in-source position.
fn payload_hash(record: &Record) -> u64 {
    let mut hasher = FxHasher::default();
    for (key, value) in &record.data {
        key.hash(&mut hasher);
        value.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

fn content_digest(content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
