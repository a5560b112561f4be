//! Deterministic in-memory store binding.
//!
//! Brute-force cosine ranking over a `RwLock`-guarded map; the semantics
//! match the SQLite binding so test runs and offline runs exercise the
//! same contract. Also implements [`DocumentStore`] for retrieval's
//! conversation lookups.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    DocumentStore, MemoryEntry, MemoryEntryPatch, MemoryFilter, MemoryQueryResult, MemoryStore,
    ScoredEntry, cosine_distance, pad_or_truncate,
};
use crate::error::StoreError;
use crate::model::Document;
use crate::oracle::EmbeddingOracle;
use crate::progress::{PipelineStage, Progress, ProgressSink};

/// In-memory [`MemoryStore`] and [`DocumentStore`].
pub struct InMemoryStore {
    embedder: Arc<dyn EmbeddingOracle>,
    dim: usize,
    entries: RwLock<FxHashMap<Uuid, MemoryEntry>>,
    documents: RwLock<FxHashMap<String, Document>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(embedder: Arc<dyn EmbeddingOracle>, dim: usize) -> Self {
        Self {
            embedder,
            dim,
            entries: RwLock::new(FxHashMap::default()),
            documents: RwLock::new(FxHashMap::default()),
        }
    }

    /// Snapshot of all entries, ordered by creation time then id; used by
    /// tests asserting determinism.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MemoryEntry> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        let vectors = self
            .embedder
            .embed(std::slice::from_ref(&text.to_string()))
            .await
            .map_err(|err| StoreError::backend(format!("query embedding failed: {err}")))?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::backend("embedding oracle returned no vector"))?;
        Ok(pad_or_truncate(vector, self.dim))
    }

    fn ranked(&self, query: &[f32], filter: Option<&MemoryFilter>) -> Vec<ScoredEntry> {
        let entries = self.entries.read();
        let mut scored: Vec<ScoredEntry> = entries
            .values()
            .filter(|entry| filter.is_none_or(|f| f.matches(entry)))
            .map(|entry| ScoredEntry {
                distance: cosine_distance(query, &entry.embedding),
                entry: entry.clone(),
            })
            .filter(|scored| {
                filter
                    .and_then(|f| f.max_distance)
                    .is_none_or(|max| scored.distance <= max)
            })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
        });
        scored
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store(
        &self,
        entries: Vec<MemoryEntry>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let total = entries.len() as u64;
        // Single transaction: stage everything, then swap in.
        let mut staged = Vec::with_capacity(entries.len());
        for (idx, mut entry) in entries.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            entry.embedding = pad_or_truncate(entry.embedding, self.dim);
            staged.push(entry);
            progress.publish(Progress::new(
                PipelineStage::StoreEntries,
                idx as u64 + 1,
                total,
            ));
        }
        let mut map = self.entries.write();
        for entry in staged {
            map.insert(entry.id, entry);
        }
        drop(map);
        progress.publish_final(Progress::new(PipelineStage::StoreEntries, total, total));
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: MemoryEntryPatch) -> Result<(), StoreError> {
        let mut map = self.entries.write();
        let entry = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        patch.apply_to(entry);
        entry.embedding = pad_or_truncate(std::mem::take(&mut entry.embedding), self.dim);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.entries
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn get(&self, id: Uuid) -> Result<Option<MemoryEntry>, StoreError> {
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entries.read().len())
    }

    async fn query(
        &self,
        text: &str,
        filter: Option<&MemoryFilter>,
    ) -> Result<MemoryQueryResult, StoreError> {
        let scored = self.query_with_distance(text, filter).await?;
        Ok(MemoryQueryResult {
            entries: scored.into_iter().map(|s| s.entry).collect(),
            aggregates: Vec::new(),
        })
    }

    async fn query_with_distance(
        &self,
        text: &str,
        filter: Option<&MemoryFilter>,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        let query = self.embed_query(text).await?;
        Ok(self.ranked(&query, filter))
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn put_documents(&self, documents: &[Document]) -> Result<(), StoreError> {
        let mut map = self.documents.write();
        for doc in documents {
            map.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        let map = self.documents.read();
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }
}
