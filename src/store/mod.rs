//! Hybrid memory store: content entries, embeddings, optional triples,
//! and a tag index behind one trait.
//!
//! The [`MemoryStore`] trait is the seam between the pipeline and the
//! storage engine. The reference binding ([`sqlite::SqliteMemoryStore`])
//! keeps entries in SQLite with `sqlite-vec` cosine ranking; the
//! deterministic [`memory::InMemoryStore`] backs tests and offline runs.
//! The store never deduplicates by content; that decision belongs to the
//! consolidator.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::Fact;
use crate::progress::ProgressSink;

/// Persisted form of a [`Fact`] with its embedding.
///
/// Uniquely keyed by `id`; `content_hash` is stored for inspection but is
/// not a uniqueness constraint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub content: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// Chunk ids this entry was observed in.
    pub document_references: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    /// Fixed-dimension vector; padded or truncated by the store.
    pub embedding: Vec<f32>,
}

impl MemoryEntry {
    /// Build an entry from an extracted fact and its embedding.
    #[must_use]
    pub fn from_fact(fact: &Fact, embedding: Vec<f32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_hash: content_hash(&fact.content),
            content: fact.content.clone(),
            created_at: fact.timestamp,
            updated_at: fact.timestamp,
            tags: fact.tags.clone(),
            metadata: fact.metadata.clone(),
            document_references: fact.document_references.clone(),
            subject: fact.subject.clone(),
            predicate: fact.predicate.clone(),
            object: fact.object.clone(),
            embedding,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Overwrite content, refreshing the hash alongside.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.content_hash = content_hash(&self.content);
    }
}

/// MD5 digest of entry content, hex-encoded.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pad with zeros or truncate so `vector` has exactly `dim` components.
///
/// Lossy across embedding models of different dimensionality; kept so a
/// store created under one model accepts vectors from another.
#[must_use]
pub fn pad_or_truncate(mut vector: Vec<f32>, dim: usize) -> Vec<f32> {
    vector.resize(dim, 0.0);
    vector
}

/// Partial update applied by [`MemoryStore::update`].
#[derive(Clone, Debug, Default)]
pub struct MemoryEntryPatch {
    pub content: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub tags: Option<Vec<String>>,
    /// Provenance references appended (deduplicated) to the entry.
    pub append_references: Vec<String>,
    /// When unset, `updated_at` still refreshes to now.
    pub updated_at: Option<DateTime<Utc>>,
}

impl MemoryEntryPatch {
    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_appended_references(mut self, refs: Vec<String>) -> Self {
        self.append_references = refs;
        self
    }

    /// Apply this patch to an entry, preserving `created_at`.
    pub fn apply_to(&self, entry: &mut MemoryEntry) {
        if let Some(content) = &self.content {
            entry.set_content(content.clone());
        }
        if let Some(embedding) = &self.embedding {
            entry.embedding = embedding.clone();
        }
        if let Some(tags) = &self.tags {
            entry.tags = tags.clone();
        }
        for reference in &self.append_references {
            if !entry.document_references.contains(reference) {
                entry.document_references.push(reference.clone());
            }
        }
        entry.updated_at = self.updated_at.unwrap_or_else(Utc::now);
    }
}

/// Retrieval predicate. Every clause must hold for an entry to be
/// returned; empty clauses are no-ops.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Matches the entry subject or the `people` metadata of its source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_all: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_any: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub document_references: Vec<String>,
    /// Cosine-distance cutoff for ranked queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<f32>,
}

impl MemoryFilter {
    /// Whether `entry` satisfies every non-distance clause.
    #[must_use]
    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(subject) = &self.subject {
            if entry
                .subject
                .as_deref()
                .is_none_or(|s| !s.eq_ignore_ascii_case(subject))
            {
                return false;
            }
        }
        if let Some(contact) = &self.contact_name {
            let in_subject = entry
                .subject
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(contact));
            let in_people = entry
                .metadata
                .get("people")
                .is_some_and(|p| p.split(',').any(|name| name.trim().eq_ignore_ascii_case(contact)));
            if !in_subject && !in_people {
                return false;
            }
        }
        if !self.tags_all.iter().all(|tag| entry.tags.contains(tag)) {
            return false;
        }
        if !self.tags_any.is_empty() && !self.tags_any.iter().any(|tag| entry.tags.contains(tag)) {
            return false;
        }
        // Temporal clauses read the entry's latest observation time.
        if let Some(after) = self.timestamp_after {
            if entry.updated_at < after {
                return false;
            }
        }
        if let Some(before) = self.timestamp_before {
            if entry.updated_at > before {
                return false;
            }
        }
        if !self.document_references.is_empty()
            && !self
                .document_references
                .iter()
                .any(|r| entry.document_references.contains(r))
        {
            return false;
        }
        true
    }

    #[must_use]
    pub fn with_max_distance(mut self, distance: f32) -> Self {
        self.max_distance = Some(distance);
        self
    }
}

/// An entry with its cosine distance from the query.
#[derive(Clone, Debug)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub distance: f32,
}

/// Result of a ranked-and-filtered query.
#[derive(Clone, Debug, Default)]
pub struct MemoryQueryResult {
    pub entries: Vec<MemoryEntry>,
    /// Scalar results rendered as strings, e.g. `count=42`.
    pub aggregates: Vec<String>,
}

/// The memory store contract.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Transactional batch insert. Progress is published per entry and is
    /// monotonic within the call.
    async fn store(
        &self,
        entries: Vec<MemoryEntry>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Merge partial fields into the entry keyed by `id`.
    async fn update(&self, id: Uuid, patch: MemoryEntryPatch) -> Result<(), StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<MemoryEntry>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Vector-ranked then filtered; ties broken by newer timestamp.
    async fn query(
        &self,
        text: &str,
        filter: Option<&MemoryFilter>,
    ) -> Result<MemoryQueryResult, StoreError>;

    /// Like [`Self::query`], with distances exposed.
    async fn query_with_distance(
        &self,
        text: &str,
        filter: Option<&MemoryFilter>,
    ) -> Result<Vec<ScoredEntry>, StoreError>;
}

/// Narrow interface for retrieving the source documents facts reference.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put_documents(&self, documents: &[crate::model::Document]) -> Result<(), StoreError>;

    /// Fetch documents by id; unknown ids are skipped.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<crate::model::Document>, StoreError>;
}

/// Cosine distance between two equal-length vectors (`1 - cosine
/// similarity`); returns 2.0 for degenerate inputs so they rank last.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry() -> MemoryEntry {
        let fact_time = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        MemoryEntry {
            id: Uuid::new_v4(),
            content: "Alice lives in Paris.".into(),
            content_hash: content_hash("Alice lives in Paris."),
            created_at: fact_time,
            updated_at: fact_time,
            tags: vec!["personal".into(), "location".into()],
            metadata: BTreeMap::from([("people".to_string(), "alice,bob".to_string())]),
            document_references: vec!["chat:1#0".into()],
            subject: Some("Alice".into()),
            predicate: Some("lives_in".into()),
            object: Some("Paris".into()),
            embedding: vec![1.0, 0.0],
        }
    }

    #[test]
    fn hash_is_md5_hex() {
        assert_eq!(content_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn padding_and_truncation() {
        assert_eq!(pad_or_truncate(vec![1.0], 3), vec![1.0, 0.0, 0.0]);
        assert_eq!(pad_or_truncate(vec![1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
    }

    #[test]
    fn filter_clauses_all_apply() {
        let e = entry();
        assert!(MemoryFilter::default().matches(&e));
        assert!(
            MemoryFilter {
                subject: Some("alice".into()),
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            !MemoryFilter {
                subject: Some("carol".into()),
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            MemoryFilter {
                contact_name: Some("Bob".into()),
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            MemoryFilter {
                tags_all: vec!["personal".into(), "location".into()],
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            !MemoryFilter {
                tags_all: vec!["personal".into(), "work".into()],
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            MemoryFilter {
                tags_any: vec!["work".into(), "location".into()],
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            MemoryFilter {
                document_references: vec!["chat:1#0".into(), "other".into()],
                ..Default::default()
            }
            .matches(&e)
        );
    }

    #[test]
    fn temporal_clauses_use_latest_observation() {
        let e = entry();
        let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let jun = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(
            MemoryFilter {
                timestamp_after: Some(jan),
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            !MemoryFilter {
                timestamp_after: Some(jun),
                ..Default::default()
            }
            .matches(&e)
        );
        assert!(
            MemoryFilter {
                timestamp_before: Some(jun),
                ..Default::default()
            }
            .matches(&e)
        );
    }

    #[test]
    fn patch_preserves_created_at() {
        let mut e = entry();
        let created = e.created_at;
        let patch = MemoryEntryPatch::content("Alice lives in Berlin.")
            .with_appended_references(vec!["chat:2#0".into(), "chat:1#0".into()]);
        patch.apply_to(&mut e);
        assert_eq!(e.created_at, created);
        assert!(e.updated_at > created);
        assert_eq!(e.content, "Alice lives in Berlin.");
        assert_eq!(e.content_hash, content_hash("Alice lives in Berlin."));
        // Existing reference was not duplicated.
        assert_eq!(
            e.document_references,
            vec!["chat:1#0".to_string(), "chat:2#0".to_string()]
        );
    }

    #[test]
    fn cosine_distance_basics() {
        assert!((cosine_distance(&[1.0, 0.0], &[1.0, 0.0])).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[], &[]), 2.0);
        assert_eq!(cosine_distance(&[0.0], &[0.0]), 2.0);
    }
}
