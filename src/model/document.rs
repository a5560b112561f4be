use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on a normalized tag, in characters.
const MAX_TAG_CHARS: usize = 256;

/// One utterance inside a conversation document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: String,
    pub time: DateTime<Utc>,
    pub content: String,
}

impl Turn {
    #[must_use]
    pub fn new(speaker: impl Into<String>, time: DateTime<Utc>, content: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            time,
            content: content.into(),
        }
    }

    /// Serialized length of this turn inside a conversation rendering.
    #[must_use]
    pub fn rendered_len(&self) -> usize {
        // "speaker: content\n"
        self.speaker.chars().count() + 2 + self.content.chars().count() + 1
    }
}

/// Variant-specific payload of a [`Document`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentBody {
    /// Ordered sequence of turns between `user` and `people`.
    Conversation {
        user: String,
        people: Vec<String>,
        turns: Vec<Turn>,
    },
    /// A single block of text.
    Text { content: String },
    /// Reference to an external blob plus descriptive text; downstream
    /// stages treat the description as Text.
    Media { blob_ref: String, description: String },
}

/// Canonical, typed unit of ingest.
///
/// The `id` is deterministic from `(source, natural key)` so re-ingest is
/// idempotent; `timestamp` is the earliest contained event; `tags` are
/// normalized lower-case tokens; metadata values are strings only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub body: DocumentBody,
}

impl Document {
    #[must_use]
    pub fn text(
        id: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            timestamp,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            body: DocumentBody::Text {
                content: content.into(),
            },
        }
    }

    #[must_use]
    pub fn conversation(
        id: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        user: impl Into<String>,
        people: Vec<String>,
        turns: Vec<Turn>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            timestamp,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            body: DocumentBody::Conversation {
                user: user.into(),
                people,
                turns,
            },
        }
    }

    /// Add tags, keeping only those that survive [`normalize_tag`].
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = tags
            .into_iter()
            .filter_map(|t| normalize_tag(t.as_ref()))
            .collect();
        // Tag order carries no meaning; sorting makes dedup total.
        self.tags.sort_unstable();
        self.tags.dedup();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The textual serialization used for chunk sizing, extraction, and
    /// artifact inspection. Conversations render one `speaker: content`
    /// line per turn; media render their description.
    #[must_use]
    pub fn content_text(&self) -> String {
        match &self.body {
            DocumentBody::Conversation { turns, .. } => {
                let mut out = String::new();
                for turn in turns {
                    out.push_str(&turn.speaker);
                    out.push_str(": ");
                    out.push_str(&turn.content);
                    out.push('\n');
                }
                out
            }
            DocumentBody::Text { content } => content.clone(),
            DocumentBody::Media { description, .. } => description.clone(),
        }
    }

    /// Character count of [`Self::content_text`] without materializing it.
    #[must_use]
    pub fn content_len(&self) -> usize {
        match &self.body {
            DocumentBody::Conversation { turns, .. } => {
                turns.iter().map(Turn::rendered_len).sum()
            }
            DocumentBody::Text { content } => content.chars().count(),
            DocumentBody::Media { description, .. } => description.chars().count(),
        }
    }

    /// Participants of a conversation document, comma-joined for metadata.
    #[must_use]
    pub fn people_list(&self) -> Option<String> {
        match &self.body {
            DocumentBody::Conversation { people, .. } if !people.is_empty() => {
                Some(people.join(","))
            }
            _ => None,
        }
    }
}

/// Normalize a raw tag into the canonical `[a-z0-9_]+` form.
///
/// Lower-cases, maps whitespace and dashes to underscores, drops every
/// other character, and rejects empty or oversized results.
#[must_use]
pub fn normalize_tag(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let lowered = ch.to_ascii_lowercase();
        match lowered {
            'a'..='z' | '0'..='9' | '_' => out.push(lowered),
            ' ' | '-' | '\t' => out.push('_'),
            _ => {}
        }
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() || out.chars().count() > MAX_TAG_CHARS {
        None
    } else {
        Some(out)
    }
}

/// Chunk id for chunk `n` of `doc_id`: `<docID>#<n>`.
#[must_use]
pub fn chunk_id(doc_id: &str, n: usize) -> String {
    format!("{doc_id}#{n}")
}

/// Strip a chunk suffix, recovering the parent document id.
#[must_use]
pub fn parent_document_id(chunk_or_doc_id: &str) -> &str {
    match chunk_or_doc_id.rsplit_once('#') {
        Some((parent, suffix)) if suffix.bytes().all(|b| b.is_ascii_digit()) => parent,
        _ => chunk_or_doc_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, 0, 0).unwrap()
    }

    #[test]
    fn tag_normalization() {
        assert_eq!(normalize_tag("Work Chat"), Some("work_chat".to_string()));
        assert_eq!(normalize_tag("  e-mail  "), Some("e_mail".to_string()));
        assert_eq!(normalize_tag("già2024!"), Some("gi2024".to_string()));
        assert_eq!(normalize_tag("___"), None);
        assert_eq!(normalize_tag(""), None);
        let long = "a".repeat(MAX_TAG_CHARS + 1);
        assert_eq!(normalize_tag(&long), None);
    }

    #[test]
    fn conversation_rendering() {
        let doc = Document::conversation(
            "chat_export:42",
            "chat_export",
            at(9),
            "me",
            vec!["alice".into()],
            vec![
                Turn::new("alice", at(9), "hi"),
                Turn::new("me", at(10), "hello"),
            ],
        );
        assert_eq!(doc.content_text(), "alice: hi\nme: hello\n");
        assert_eq!(doc.content_len(), doc.content_text().chars().count());
    }

    #[test]
    fn chunk_id_round_trip() {
        let id = chunk_id("notes:abc", 3);
        assert_eq!(id, "notes:abc#3");
        assert_eq!(parent_document_id(&id), "notes:abc");
        // Non-numeric suffixes are part of the id itself.
        assert_eq!(parent_document_id("mail:a#b"), "mail:a#b");
        assert_eq!(parent_document_id("plain"), "plain");
    }

    #[test]
    fn tags_are_filtered_and_deduped() {
        let doc = Document::text("t:1", "t", at(0), "x").with_tags(["Foo", "foo", "!!"]);
        assert_eq!(doc.tags, vec!["foo".to_string()]);
        // Non-adjacent duplicates collapse too.
        let doc = Document::text("t:2", "t", at(0), "x").with_tags(["foo", "bar", "Foo"]);
        assert_eq!(doc.tags, vec!["bar".to_string(), "foo".to_string()]);
    }
}
