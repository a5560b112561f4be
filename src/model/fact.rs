use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Document;
use super::document::parent_document_id;

/// An atomic, self-contained assertion extracted from one chunk.
///
/// One assertion per fact; `content` must stand on its own without the
/// chunk for context. `document_references` point at the chunks the fact
/// was extracted from, for provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub content: String,
    /// Parent document the originating chunk belongs to.
    pub source_document_id: String,
    /// Chunk ids this fact was observed in.
    pub document_references: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    pub tags: Vec<String>,
    /// Source metadata carried through from the originating chunk.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Fact {
    /// Build a fact observed in `chunk`, inheriting its timestamp and tags.
    #[must_use]
    pub fn observed_in(chunk: &Document, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            source_document_id: parent_document_id(&chunk.id).to_string(),
            document_references: vec![chunk.id.clone()],
            subject: None,
            predicate: None,
            object: None,
            tags: chunk.tags.clone(),
            metadata: chunk.metadata.clone(),
            timestamp: chunk.timestamp,
            confidence: 1.0,
        }
    }

    #[must_use]
    pub fn with_triple(
        mut self,
        subject: Option<String>,
        predicate: Option<String>,
        object: Option<String>,
    ) -> Self {
        self.subject = subject.filter(|s| !s.trim().is_empty());
        self.predicate = predicate.filter(|s| !s.trim().is_empty());
        self.object = object.filter(|s| !s.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Key used for within-chunk dedupe: lower-cased, whitespace-collapsed
    /// content.
    #[must_use]
    pub fn normalized_content(&self) -> String {
        normalize_content(&self.content)
    }
}

/// Lower-case and collapse runs of whitespace.
#[must_use]
pub(crate) fn normalize_content(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut pending_space = false;
    for ch in content.trim().chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            for lowered in ch.to_lowercase() {
                out.push(lowered);
            }
        }
    }
    out
}
