//! Retrieval: question → query plan → merged results.
//!
//! The [`planner::RetrievalPlanner`] turns a natural-language question
//! into a [`planner::QueryIntent`] (LLM-assisted, with a pure
//! content-search fallback) and compiles it into an ordered list of
//! [`Step`]s. The [`RetrievalExecutor`] runs the steps sequentially
//! (later steps see earlier results by index) and merges facts,
//! document snippets, and scalar aggregates.

pub mod planner;

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::model::{Document, parent_document_id};
use crate::store::{DocumentStore, MemoryEntry, MemoryFilter, MemoryStore};

pub use planner::{EntityRef, IntentType, QueryIntent, RetrievalPlanner, TemporalContext};

/// Characters of document text kept in a snippet.
const SNIPPET_CHARS: usize = 280;

/// One step of a compiled retrieval plan.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Vector search with constraints.
    FilterMemories {
        query_text: String,
        filter: MemoryFilter,
    },
    /// Look up the source documents referenced by the facts produced by
    /// earlier steps.
    CheckConversations { depends_on: Vec<usize> },
}

/// Excerpt of a source document returned alongside facts.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnippet {
    pub document_id: String,
    pub source: String,
    pub snippet: String,
}

impl DocumentSnippet {
    fn from_document(document: &Document) -> Self {
        let text = document.content_text();
        let snippet: String = text.chars().take(SNIPPET_CHARS).collect();
        Self {
            document_id: document.id.clone(),
            source: document.source.clone(),
            snippet,
        }
    }
}

/// Merged result of one retrieval: facts first (deduped by id), then
/// document snippets, then scalar aggregates.
#[derive(Clone, Debug, Default)]
pub struct RetrievalOutcome {
    pub entries: Vec<MemoryEntry>,
    pub documents: Vec<DocumentSnippet>,
    pub aggregates: Vec<String>,
}

enum StepOutput {
    Entries(Vec<MemoryEntry>),
    Documents(Vec<Document>),
}

/// Executes compiled plans against the memory and document stores.
pub struct RetrievalExecutor {
    store: Arc<dyn MemoryStore>,
    documents: Arc<dyn DocumentStore>,
    planner: RetrievalPlanner,
    config: PipelineConfig,
}

impl RetrievalExecutor {
    #[must_use]
    pub fn new(
        store: Arc<dyn MemoryStore>,
        documents: Arc<dyn DocumentStore>,
        planner: RetrievalPlanner,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            documents,
            planner,
            config,
        }
    }

    /// Plan and execute one question under the query timeout.
    pub async fn answer(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome, PipelineError> {
        let work = async {
            let intent = self.planner.plan(question, cancel).await;
            let steps = self.planner.compile(&intent, question);
            self.execute(&steps, cancel).await
        };
        match tokio::time::timeout(self.config.query_timeout(), work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StoreError::backend(format!(
                "retrieval timed out after {}s",
                self.config.query_timeout_secs
            ))
            .into()),
        }
    }

    /// Run the steps in order; step `i` may read the outputs of steps
    /// `< i` through `depends_on` indices.
    pub async fn execute(
        &self,
        steps: &[Step],
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome, PipelineError> {
        let mut outputs: Vec<StepOutput> = Vec::with_capacity(steps.len());

        for step in steps {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match step {
                Step::FilterMemories { query_text, filter } => {
                    let result = self.store.query(query_text, Some(filter)).await?;
                    debug!(count = result.entries.len(), "filter_memories step");
                    outputs.push(StepOutput::Entries(result.entries));
                }
                Step::CheckConversations { depends_on } => {
                    let mut ids = Vec::new();
                    let mut seen = FxHashSet::default();
                    for &idx in depends_on {
                        let Some(StepOutput::Entries(entries)) = outputs.get(idx) else {
                            continue;
                        };
                        for entry in entries {
                            for reference in &entry.document_references {
                                let doc_id = parent_document_id(reference).to_string();
                                if seen.insert(doc_id.clone()) {
                                    ids.push(doc_id);
                                }
                            }
                        }
                    }
                    let documents = self.documents.fetch(&ids).await?;
                    debug!(requested = ids.len(), found = documents.len(), "check_conversations step");
                    outputs.push(StepOutput::Documents(documents));
                }
            }
        }

        Ok(merge(outputs))
    }
}

fn merge(outputs: Vec<StepOutput>) -> RetrievalOutcome {
    let mut outcome = RetrievalOutcome::default();
    let mut seen_entries = FxHashSet::default();
    let mut seen_documents = FxHashSet::default();

    for output in outputs {
        match output {
            StepOutput::Entries(entries) => {
                for entry in entries {
                    if seen_entries.insert(entry.id) {
                        outcome.entries.push(entry);
                    }
                }
            }
            StepOutput::Documents(documents) => {
                for document in documents {
                    if seen_documents.insert(document.id.clone()) {
                        outcome.documents.push(DocumentSnippet::from_document(&document));
                    }
                }
            }
        }
    }

    outcome.aggregates.push(format!("count={}", outcome.entries.len()));
    outcome
}
