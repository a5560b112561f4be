//! Fact consolidation: the ADD / UPDATE / DELETE / NONE decision.
//!
//! Each fact walks the state machine
//! `EXTRACTED → EMBEDDED → NEIGHBORHOOD_QUERIED → DECIDED → terminal`:
//! its embedding is computed (batched), the store is asked for nearest
//! neighbors inside the similarity gate, and the chat oracle chooses one
//! action over the neighbor list. Invalid decisions degrade to NONE with
//! a warning and are never fatal. Facts from one ingest batch are
//! consolidated serially so each decision sees the commits before it;
//! a short settle delay after each commit compensates for backends that
//! index asynchronously.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::model::Fact;
use crate::oracle::{
    ChatMessage, ChatOracle, CompletionRequest, EmbeddingOracle, RetryPolicy, complete_with_retry,
    embed_with_retry,
};
use crate::progress::{PipelineStage, Progress, ProgressSink};
use crate::store::{MemoryEntry, MemoryEntryPatch, MemoryFilter, MemoryStore, pad_or_truncate};

/// System prompt for the consolidation decision.
pub const CONSOLIDATION_SYSTEM_PROMPT: &str = "\
You maintain a long-term memory of atomic facts. Given a new fact and its \
nearest existing memories, choose exactly one action:

- ADD: the fact is new information; optionally rephrase it via \
  updated_content.
- UPDATE: the fact supersedes one existing memory; return id_to_update \
  and the merged updated_content.
- DELETE: the fact invalidates one existing memory; return id_to_delete.
- NONE: the fact is already covered; do nothing.

Respond with JSON: {\"action\": \"ADD|UPDATE|DELETE|NONE\", \
\"id_to_update\": null, \"updated_content\": null, \"id_to_delete\": null}.";

/// Where a fact ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactState {
    Extracted,
    Embedded,
    NeighborhoodQueried,
    Decided,
    CommittedAdd,
    CommittedUpdate,
    CommittedDelete,
    Dropped,
}

/// Terminal state per fact, for diagnostics and tests.
#[derive(Clone, Debug)]
pub struct FactOutcome {
    pub fact_id: String,
    pub state: FactState,
}

/// Aggregate result of one consolidation pass.
#[derive(Debug, Default)]
pub struct ConsolidationReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub dropped: usize,
    pub outcomes: Vec<FactOutcome>,
    pub warnings: Vec<String>,
}

impl ConsolidationReport {
    fn record(&mut self, fact_id: &str, state: FactState) {
        match state {
            FactState::CommittedAdd => self.added += 1,
            FactState::CommittedUpdate => self.updated += 1,
            FactState::CommittedDelete => self.deleted += 1,
            FactState::Dropped => self.dropped += 1,
            _ => {}
        }
        self.outcomes.push(FactOutcome {
            fact_id: fact_id.to_string(),
            state,
        });
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    id_to_update: Option<String>,
    #[serde(default)]
    updated_content: Option<String>,
    #[serde(default)]
    id_to_delete: Option<String>,
}

/// Validated decision, after degrading anything malformed to `None`.
#[derive(Debug, PartialEq)]
enum Decision {
    Add { updated_content: Option<String> },
    Update { id: Uuid, updated_content: String },
    Delete { id: Uuid },
    None,
}

/// Drives the consolidation state machine over the memory store.
pub struct Consolidator {
    chat: Arc<dyn ChatOracle>,
    embedder: Arc<dyn EmbeddingOracle>,
    store: Arc<dyn MemoryStore>,
    policy: RetryPolicy,
    config: PipelineConfig,
    fence: Regex,
}

impl Consolidator {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatOracle>,
        embedder: Arc<dyn EmbeddingOracle>,
        store: Arc<dyn MemoryStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            chat,
            embedder,
            store,
            policy: RetryPolicy::from_config(&config),
            config,
            fence: Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("static regex"),
        }
    }

    /// Consolidate one ingest batch of facts, serially, in input order.
    ///
    /// Input order is commit order: callers pass facts ordered by document
    /// then chunk, which gives every decision deterministic visibility
    /// into the commits preceding it within the same payload.
    pub async fn consolidate(
        &self,
        facts: Vec<Fact>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ConsolidationReport, PipelineError> {
        let total = facts.len() as u64;
        let mut report = ConsolidationReport::default();
        let embeddings = self.embed_all(&facts, &mut report, cancel).await?;

        for (idx, (fact, embedding)) in facts.iter().zip(embeddings).enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let Some(embedding) = embedding else {
                report.record(&fact.id, FactState::Dropped);
                progress.publish(Progress::new(PipelineStage::Consolidate, idx as u64 + 1, total));
                continue;
            };

            let state = self
                .consolidate_one(fact, embedding, &mut report, cancel)
                .await?;
            report.record(&fact.id, state);
            progress.publish(Progress::new(PipelineStage::Consolidate, idx as u64 + 1, total));

            let committed = matches!(
                state,
                FactState::CommittedAdd | FactState::CommittedUpdate | FactState::CommittedDelete
            );
            if committed && !self.config.settle_delay().is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    () = tokio::time::sleep(self.config.settle_delay()) => {}
                }
            }
        }

        progress.publish_final(Progress::new(PipelineStage::Consolidate, total, total));
        Ok(report)
    }

    /// Batch the embedding calls; a failed slice drops its facts with a
    /// warning instead of failing the pass.
    async fn embed_all(
        &self,
        facts: &[Fact],
        report: &mut ConsolidationReport,
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Vec<f32>>>, PipelineError> {
        let mut out = Vec::with_capacity(facts.len());
        for slice in facts.chunks(self.config.batch_size.max(1)) {
            let texts: Vec<String> = slice.iter().map(|f| f.content.clone()).collect();
            match embed_with_retry(self.embedder.as_ref(), &texts, &self.policy, cancel).await {
                Ok(vectors) if vectors.len() == slice.len() => {
                    out.extend(
                        vectors
                            .into_iter()
                            .map(|v| Some(pad_or_truncate(v, self.config.embedding_dim))),
                    );
                }
                Ok(vectors) => {
                    let message = format!(
                        "embedding batch returned {} vectors for {} facts",
                        vectors.len(),
                        slice.len()
                    );
                    warn!(error = %message, "dropping embedding slice");
                    report.warnings.push(message);
                    out.extend(slice.iter().map(|_| None));
                }
                Err(crate::error::OracleError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    let message = format!("embedding failed for {} facts: {err}", slice.len());
                    warn!(error = %message, "dropping embedding slice");
                    report.warnings.push(message);
                    out.extend(slice.iter().map(|_| None));
                }
            }
        }
        Ok(out)
    }

    async fn consolidate_one(
        &self,
        fact: &Fact,
        embedding: Vec<f32>,
        report: &mut ConsolidationReport,
        cancel: &CancellationToken,
    ) -> Result<FactState, PipelineError> {
        // EMBEDDED → NEIGHBORHOOD_QUERIED
        let filter =
            MemoryFilter::default().with_max_distance(self.config.max_neighbor_distance);
        let mut neighbors = match self.store.query_with_distance(&fact.content, Some(&filter)).await
        {
            Ok(scored) => scored,
            Err(StoreError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) if err.is_transient() => {
                self.store
                    .query_with_distance(&fact.content, Some(&filter))
                    .await
                    .map_err(PipelineError::from)?
            }
            Err(err) => return Err(err.into()),
        };
        neighbors.truncate(self.config.neighbor_k);

        // NEIGHBORHOOD_QUERIED → DECIDED
        let decision = match self.decide(fact, &neighbors, cancel).await {
            Ok(decision) => decision,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                let message = format!("decision failed for fact {}: {err}", fact.id);
                warn!(fact_id = %fact.id, error_kind = err.kind(), "consolidation decision failed");
                report.warnings.push(message);
                return Ok(FactState::Dropped);
            }
        };

        // DECIDED → terminal
        match decision {
            Decision::Add { updated_content } => {
                let mut entry = MemoryEntry::from_fact(fact, embedding);
                if let Some(content) = updated_content {
                    entry.set_content(content);
                }
                self.store_once_retrying(entry, cancel).await?;
                Ok(FactState::CommittedAdd)
            }
            Decision::Update { id, updated_content } => {
                let new_embedding = self.embed_one(&updated_content, cancel).await;
                let mut patch = MemoryEntryPatch::content(updated_content)
                    .with_appended_references(fact.document_references.clone());
                if let Some(vector) = new_embedding {
                    patch = patch.with_embedding(vector);
                }
                match self.update_once_retrying(id, patch).await {
                    Ok(()) => Ok(FactState::CommittedUpdate),
                    Err(PipelineError::Store(StoreError::NotFound { id })) => {
                        let message = format!("update target {id} does not exist");
                        warn!(fact_id = %fact.id, target = %id, "dangling update id, dropping fact");
                        report.warnings.push(message);
                        Ok(FactState::Dropped)
                    }
                    Err(err) => Err(err),
                }
            }
            Decision::Delete { id } => match self.delete_once_retrying(id).await {
                Ok(()) => Ok(FactState::CommittedDelete),
                Err(PipelineError::Store(StoreError::NotFound { id })) => {
                    let message = format!("delete target {id} does not exist");
                    warn!(fact_id = %fact.id, target = %id, "dangling delete id, dropping fact");
                    report.warnings.push(message);
                    Ok(FactState::Dropped)
                }
                Err(err) => Err(err),
            },
            Decision::None => {
                debug!(fact_id = %fact.id, "fact already covered, dropping");
                Ok(FactState::Dropped)
            }
        }
    }

    async fn decide(
        &self,
        fact: &Fact,
        neighbors: &[crate::store::ScoredEntry],
        cancel: &CancellationToken,
    ) -> Result<Decision, PipelineError> {
        let neighbor_list: Vec<serde_json::Value> = neighbors
            .iter()
            .map(|scored| {
                serde_json::json!({
                    "id": scored.entry.id.to_string(),
                    "content": scored.entry.content,
                    "distance": scored.distance,
                })
            })
            .collect();
        let payload = serde_json::json!({
            "new_fact": fact.content,
            "neighbors": neighbor_list,
        });

        let request = CompletionRequest::new(vec![
            ChatMessage::system(CONSOLIDATION_SYSTEM_PROMPT),
            ChatMessage::user(payload.to_string()),
        ])
        .expecting_json();

        let response =
            complete_with_retry(self.chat.as_ref(), &request, &self.policy, cancel).await?;
        Ok(self.parse_decision(&response.content))
    }

    /// Validate the raw decision; anything unknown or incomplete degrades
    /// to [`Decision::None`].
    fn parse_decision(&self, content: &str) -> Decision {
        let trimmed = content.trim();
        let body = self
            .fence
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .map_or(trimmed, |m| m.as_str());
        let Ok(raw) = serde_json::from_str::<RawDecision>(body) else {
            warn!("unparseable consolidation decision, degrading to NONE");
            return Decision::None;
        };

        match raw.action.trim().to_ascii_uppercase().as_str() {
            "ADD" => Decision::Add {
                updated_content: raw.updated_content.filter(|c| !c.trim().is_empty()),
            },
            "UPDATE" => {
                let id = raw.id_to_update.as_deref().and_then(|s| Uuid::parse_str(s).ok());
                let content = raw.updated_content.filter(|c| !c.trim().is_empty());
                match (id, content) {
                    (Some(id), Some(updated_content)) => Decision::Update { id, updated_content },
                    _ => {
                        warn!("UPDATE decision missing id_to_update or updated_content");
                        Decision::None
                    }
                }
            }
            "DELETE" => match raw.id_to_delete.as_deref().and_then(|s| Uuid::parse_str(s).ok()) {
                Some(id) => Decision::Delete { id },
                None => {
                    warn!("DELETE decision missing id_to_delete");
                    Decision::None
                }
            },
            "NONE" => Decision::None,
            other => {
                warn!(action = other, "unknown consolidation action, degrading to NONE");
                Decision::None
            }
        }
    }

    async fn embed_one(&self, text: &str, cancel: &CancellationToken) -> Option<Vec<f32>> {
        match embed_with_retry(
            self.embedder.as_ref(),
            std::slice::from_ref(&text.to_string()),
            &self.policy,
            cancel,
        )
        .await
        {
            Ok(vectors) => vectors
                .into_iter()
                .next()
                .map(|v| pad_or_truncate(v, self.config.embedding_dim)),
            Err(err) => {
                warn!(error = %err, "re-embedding updated content failed, keeping prior vector");
                None
            }
        }
    }

    async fn store_once_retrying(
        &self,
        entry: MemoryEntry,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let sink = crate::progress::NullProgress;
        match self.store.store(vec![entry.clone()], &sink, cancel).await {
            Err(err) if err.is_transient() => {
                self.store.store(vec![entry], &sink, cancel).await?;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    async fn update_once_retrying(
        &self,
        id: Uuid,
        patch: MemoryEntryPatch,
    ) -> Result<(), PipelineError> {
        match self.store.update(id, patch.clone()).await {
            Err(err) if err.is_transient() => Ok(self.store.update(id, patch).await?),
            other => Ok(other?),
        }
    }

    async fn delete_once_retrying(&self, id: Uuid) -> Result<(), PipelineError> {
        match self.store.delete(id).await {
            Err(err) if err.is_transient() => Ok(self.store.delete(id).await?),
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Document;
    use crate::oracle::CompletionResponse;
    use crate::oracle::stub::{HashEmbeddingOracle, StubChatOracle};
    use crate::progress::NullProgress;
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;

    const DIM: usize = 64;

    fn fact(content: &str) -> Fact {
        let chunk = Document::text("t:1#0", "t", Utc::now(), content);
        Fact::observed_in(&chunk, content)
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_embedding_dim(DIM)
            .without_delays()
    }

    fn consolidator_with(
        chat: StubChatOracle,
        store: Arc<InMemoryStore>,
    ) -> Consolidator {
        Consolidator::new(
            Arc::new(chat),
            Arc::new(HashEmbeddingOracle::new(DIM)),
            store,
            config(),
        )
    }

    fn store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new(Arc::new(HashEmbeddingOracle::new(DIM)), DIM))
    }

    #[tokio::test]
    async fn add_inserts_new_entry() {
        let store = store();
        let chat = StubChatOracle::always(r#"{"action": "ADD"}"#);
        let consolidator = consolidator_with(chat, Arc::clone(&store));
        let report = consolidator
            .consolidate(
                vec![fact("Alice lives in Paris.")],
                &NullProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        let entry = &store.snapshot()[0];
        assert_eq!(entry.content, "Alice lives in Paris.");
        assert_eq!(entry.embedding.len(), DIM);
    }

    #[tokio::test]
    async fn add_prefers_updated_content() {
        let store = store();
        let chat = StubChatOracle::always(
            r#"{"action": "ADD", "updated_content": "Alice resides in Paris."}"#,
        );
        let consolidator = consolidator_with(chat, Arc::clone(&store));
        consolidator
            .consolidate(vec![fact("Alice lives in Paris.")], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.snapshot()[0].content, "Alice resides in Paris.");
    }

    #[tokio::test]
    async fn update_rewrites_existing_entry() {
        let store = store();
        let chat = StubChatOracle::always(r#"{"action": "ADD"}"#);
        let consolidator = consolidator_with(chat, Arc::clone(&store));
        consolidator
            .consolidate(vec![fact("Alice lives in Paris.")], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        let existing = store.snapshot()[0].clone();

        let update = format!(
            r#"{{"action": "UPDATE", "id_to_update": "{}", "updated_content": "Alice lives in Berlin as of 2024."}}"#,
            existing.id
        );
        let consolidator = consolidator_with(StubChatOracle::always(update), Arc::clone(&store));
        let report = consolidator
            .consolidate(
                vec![fact("Alice moved to Berlin in 2024.")],
                &NullProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        let entry = store.get(existing.id).await.unwrap().unwrap();
        assert_eq!(entry.content, "Alice lives in Berlin as of 2024.");
        assert_eq!(entry.created_at, existing.created_at);
        assert!(entry.updated_at > existing.updated_at);
        assert!(entry.document_references.contains(&"t:1#0".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = store();
        let consolidator =
            consolidator_with(StubChatOracle::always(r#"{"action": "ADD"}"#), Arc::clone(&store));
        consolidator
            .consolidate(vec![fact("Old plan: dinner Friday.")], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        let id = store.snapshot()[0].id;

        let delete = format!(r#"{{"action": "DELETE", "id_to_delete": "{id}"}}"#);
        let consolidator = consolidator_with(StubChatOracle::always(delete), Arc::clone(&store));
        let report = consolidator
            .consolidate(
                vec![fact("Dinner on Friday was cancelled.")],
                &NullProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn none_drops_fact() {
        let store = store();
        let consolidator =
            consolidator_with(StubChatOracle::always(r#"{"action": "NONE"}"#), Arc::clone(&store));
        let report = consolidator
            .consolidate(vec![fact("Duplicate info.")], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_decisions_degrade_to_none() {
        let consolidator = consolidator_with(StubChatOracle::always("gibberish"), store());
        assert_eq!(consolidator.parse_decision("gibberish"), Decision::None);
        assert_eq!(
            consolidator.parse_decision(r#"{"action": "EXPLODE"}"#),
            Decision::None
        );
        assert_eq!(
            consolidator.parse_decision(r#"{"action": "UPDATE"}"#),
            Decision::None
        );
        assert_eq!(
            consolidator.parse_decision(r#"{"action": "DELETE", "id_to_delete": "not-a-uuid"}"#),
            Decision::None
        );
        assert_eq!(
            consolidator.parse_decision("```json\n{\"action\": \"NONE\"}\n```"),
            Decision::None
        );
    }

    #[tokio::test]
    async fn dangling_update_id_drops_with_warning() {
        let store = store();
        let ghost = Uuid::new_v4();
        let update = format!(
            r#"{{"action": "UPDATE", "id_to_update": "{ghost}", "updated_content": "x"}}"#
        );
        let consolidator = consolidator_with(StubChatOracle::always(update), Arc::clone(&store));
        let report = consolidator
            .consolidate(vec![fact("anything")], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn oracle_failure_is_not_fatal_for_the_batch() {
        let store = store();
        let chat = StubChatOracle::with_handler(|req| {
            let body = &req.messages[1].content;
            if body.contains("poison") {
                Err(crate::error::OracleError::Status {
                    status: 500,
                    message: "boom".into(),
                })
            } else {
                Ok(CompletionResponse::text(r#"{"action": "ADD"}"#))
            }
        });
        let consolidator = Consolidator::new(
            Arc::new(chat),
            Arc::new(HashEmbeddingOracle::new(DIM)),
            Arc::clone(&store) as Arc<dyn MemoryStore>,
            PipelineConfig {
                max_retries: 0,
                ..config()
            },
        );
        let report = consolidator
            .consolidate(
                vec![fact("poison pill"), fact("Good fact survives.")],
                &NullProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
