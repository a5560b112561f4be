//! End-to-end pipeline facade.
//!
//! [`MemoryPipeline`] wires the stages together: source adapters produce
//! records, the builder folds them into documents, the chunker bounds
//! them, the extractor yields facts, and the consolidator commits them to
//! the memory store. Within one [`MemoryPipeline::store_documents`] call
//! the commit order of facts follows document order (and chunk order
//! within a document); across calls no ordering is promised.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::{ArtifactStep, write_artifact};
use crate::builder::{DocumentBuilder, UsernameResolver};
use crate::chunker::chunk_documents;
use crate::config::PipelineConfig;
use crate::consolidator::{ConsolidationReport, Consolidator};
use crate::error::{PipelineError, StoreError};
use crate::extractor::{ChunkExtraction, FactExtractor};
use crate::model::{Document, Fact};
use crate::oracle::{ChatOracle, EmbeddingOracle};
use crate::progress::{PipelineStage, Progress, ProgressSink};
use crate::retrieval::{RetrievalExecutor, RetrievalOutcome, RetrievalPlanner};
use crate::runner::{PipelineRunner, plan_batches};
use crate::sources::SourceRegistry;
use crate::store::{DocumentStore, MemoryStore};

/// How far an ingest run proceeds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IngestSteps {
    /// Records → documents only.
    Basic,
    /// Plus chunking.
    Chunking,
    /// Plus fact extraction.
    Extraction,
    /// Plus consolidation into the memory store.
    #[default]
    All,
}

impl IngestSteps {
    #[must_use]
    pub fn includes_chunking(self) -> bool {
        !matches!(self, IngestSteps::Basic)
    }

    #[must_use]
    pub fn includes_extraction(self) -> bool {
        matches!(self, IngestSteps::Extraction | IngestSteps::All)
    }

    #[must_use]
    pub fn includes_consolidation(self) -> bool {
        matches!(self, IngestSteps::All)
    }
}

impl std::str::FromStr for IngestSteps {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(IngestSteps::Basic),
            "chunking" => Ok(IngestSteps::Chunking),
            "extraction" => Ok(IngestSteps::Extraction),
            "all" => Ok(IngestSteps::All),
            other => Err(PipelineError::config(format!(
                "unknown steps value '{other}', expected basic|chunking|extraction|all"
            ))),
        }
    }
}

/// Options for one ingest run.
#[derive(Clone, Debug, Default)]
pub struct IngestOptions {
    /// Directory for the optional JSON debug artifacts.
    pub output_dir: Option<PathBuf>,
    pub steps: IngestSteps,
}

/// Summary of one ingest run.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
    pub facts_extracted: usize,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub dropped: usize,
    pub warnings: Vec<String>,
    /// Set when the run was cancelled after partial commits; committed
    /// batches are not rolled back.
    pub cancelled: bool,
}

impl IngestReport {
    /// Process exit code: 0 success, 3 partial success with non-fatal
    /// errors, 1 cancelled.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            1
        } else if self.warnings.is_empty() {
            0
        } else {
            3
        }
    }

    fn absorb(&mut self, consolidation: ConsolidationReport) {
        self.added += consolidation.added;
        self.updated += consolidation.updated;
        self.deleted += consolidation.deleted;
        self.dropped += consolidation.dropped;
        self.warnings.extend(consolidation.warnings);
    }
}

/// The assembled pipeline. Build one with [`MemoryPipeline::builder`].
pub struct MemoryPipeline {
    sources: SourceRegistry,
    builder: DocumentBuilder,
    chat: Option<Arc<dyn ChatOracle>>,
    embedder: Arc<dyn EmbeddingOracle>,
    store: Arc<dyn MemoryStore>,
    documents: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    runner: PipelineRunner,
}

impl MemoryPipeline {
    #[must_use]
    pub fn builder() -> MemoryPipelineBuilder {
        MemoryPipelineBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one ingest: parse, fold, and (per `options.steps`) chunk,
    /// extract, and consolidate.
    ///
    /// Cancellation is reported through [`IngestReport::cancelled`]
    /// rather than an error so partial-commit counts survive; every other
    /// failure surfaces as [`PipelineError`].
    pub async fn ingest(
        &self,
        source_name: &str,
        input: &Path,
        options: &IngestOptions,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, PipelineError> {
        self.config.validate()?;
        let adapter = self.sources.get(source_name).ok_or_else(|| {
            PipelineError::config(format!(
                "unknown source '{source_name}', registered: {}",
                self.sources.names().join(", ")
            ))
        })?;

        let records = if input.is_dir() {
            adapter.process_directory(input)?
        } else {
            adapter.process_file(input)?
        };
        info!(source = source_name, records = records.len(), "loaded records");

        let documents = self.builder.build(records);
        progress.publish(Progress::new(
            PipelineStage::ToDocuments,
            documents.len() as u64,
            documents.len() as u64,
        ));
        if let Some(dir) = &options.output_dir {
            write_artifact(dir, ArtifactStep::ToDocuments, &documents)?;
        }

        let mut report = IngestReport {
            documents: documents.len(),
            ..IngestReport::default()
        };
        if !options.steps.includes_chunking() {
            return Ok(report);
        }

        let chunks = chunk_documents(&documents, self.config.max_chunk_chars);
        report.chunks = chunks.len();
        progress.publish(Progress::new(
            PipelineStage::ChunkDocuments,
            chunks.len() as u64,
            chunks.len() as u64,
        ));
        if let Some(dir) = &options.output_dir {
            write_artifact(dir, ArtifactStep::ChunkDocuments, &chunks)?;
        }
        if !options.steps.includes_extraction() {
            return Ok(report);
        }

        // Retrieval needs the source documents later; store them before
        // facts start referencing them.
        self.documents.put_documents(&documents).await?;

        let facts = match self.extract(chunks, &mut report, progress, cancel).await {
            Ok(facts) => facts,
            Err(err) if err.is_cancelled() => {
                report.cancelled = true;
                return Ok(report);
            }
            Err(err) => return Err(err),
        };
        report.facts_extracted = facts.len();
        if let Some(dir) = &options.output_dir {
            write_artifact(dir, ArtifactStep::ExtractFacts, &facts)?;
        }
        if !options.steps.includes_consolidation() {
            return Ok(report);
        }

        match self.consolidate(facts, progress, cancel).await {
            Ok(consolidation) => report.absorb(consolidation),
            Err(err) if err.is_cancelled() => report.cancelled = true,
            Err(err) => return Err(err),
        }
        Ok(report)
    }

    /// Store already-built documents: chunk, extract, consolidate.
    ///
    /// The ordering contract lives here: facts are consolidated in
    /// document order, chunks in order within each document.
    pub async fn store_documents(
        &self,
        documents: &[Document],
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, PipelineError> {
        let mut report = IngestReport {
            documents: documents.len(),
            ..IngestReport::default()
        };
        self.documents.put_documents(documents).await?;
        let chunks = chunk_documents(documents, self.config.max_chunk_chars);
        report.chunks = chunks.len();

        let facts = match self.extract(chunks, &mut report, progress, cancel).await {
            Ok(facts) => facts,
            Err(err) if err.is_cancelled() => {
                report.cancelled = true;
                return Ok(report);
            }
            Err(err) => return Err(err),
        };
        report.facts_extracted = facts.len();

        match self.consolidate(facts, progress, cancel).await {
            Ok(consolidation) => report.absorb(consolidation),
            Err(err) if err.is_cancelled() => report.cancelled = true,
            Err(err) => return Err(err),
        }
        Ok(report)
    }

    /// Answer a question against the store.
    pub async fn query(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome, PipelineError> {
        let planner = match &self.chat {
            Some(chat) => RetrievalPlanner::new(Arc::clone(chat), &self.config),
            None => RetrievalPlanner::offline(),
        };
        let executor = RetrievalExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.documents),
            planner,
            self.config.clone(),
        );
        executor.answer(question, cancel).await
    }

    /// Fan chunks out to the extractor under the batch semaphore and
    /// return facts in document/chunk order.
    async fn extract(
        &self,
        chunks: Vec<Document>,
        report: &mut IngestReport,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fact>, PipelineError> {
        let Some(chat) = &self.chat else {
            return Err(PipelineError::config(
                "no LLM credentials configured; fact extraction is disabled \
                 (run with --steps basic or chunking, or set the API key)",
            ));
        };
        let extractor = Arc::new(FactExtractor::new(Arc::clone(chat), &self.config));

        let batches = plan_batches(
            chunks,
            Document::content_len,
            self.config.batch_size,
            self.config.max_batch_text_len,
        );
        info!(batches = batches.len(), "extraction batches planned");

        let run = self
            .runner
            .run(
                batches,
                {
                    let extractor = Arc::clone(&extractor);
                    move |batch, token| {
                        let extractor = Arc::clone(&extractor);
                        async move {
                            let mut extractions = Vec::with_capacity(batch.items.len());
                            for chunk in &batch.items {
                                if token.is_cancelled() {
                                    return Err(PipelineError::Cancelled);
                                }
                                // An oracle failure is per-item: the rest
                                // of the batch still extracts.
                                match extractor.extract(chunk, &token).await {
                                    Ok(extraction) => extractions.push(extraction),
                                    Err(err) if err.is_cancelled() => {
                                        return Err(PipelineError::Cancelled);
                                    }
                                    Err(err) => {
                                        warn!(
                                            chunk_id = %chunk.id,
                                            error_kind = err.kind(),
                                            "extraction failed for chunk"
                                        );
                                        extractions.push(ChunkExtraction {
                                            facts: Vec::new(),
                                            warnings: vec![format!(
                                                "extraction failed for {}: {err}",
                                                chunk.id
                                            )],
                                        });
                                    }
                                }
                            }
                            Ok(extractions)
                        }
                    }
                },
                PipelineStage::ExtractFacts,
                progress,
                cancel,
            )
            .await?;

        // Submission order restores the document/chunk ordering the
        // consolidator's commit-order contract requires.
        let mut facts = Vec::new();
        for extraction in run.into_submission_order().into_iter().flatten() {
            for warning in extraction.warnings {
                warn!(warning = %warning, "extraction warning");
                report.warnings.push(warning);
            }
            facts.extend(extraction.facts);
        }
        Ok(facts)
    }

    /// Consolidate one ingest batch under the store timeout.
    async fn consolidate(
        &self,
        facts: Vec<Fact>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ConsolidationReport, PipelineError> {
        let Some(chat) = &self.chat else {
            return Err(PipelineError::config(
                "no LLM credentials configured; consolidation is disabled",
            ));
        };
        let consolidator = Consolidator::new(
            Arc::clone(chat),
            Arc::clone(&self.embedder),
            Arc::clone(&self.store),
            self.config.clone(),
        );
        match tokio::time::timeout(
            self.config.store_timeout(),
            consolidator.consolidate(facts, progress, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::backend(format!(
                "store call exceeded {}s",
                self.config.store_timeout_secs
            ))
            .into()),
        }
    }
}

/// Assembles a [`MemoryPipeline`].
#[derive(Default)]
pub struct MemoryPipelineBuilder {
    sources: Option<SourceRegistry>,
    builder: Option<DocumentBuilder>,
    chat: Option<Arc<dyn ChatOracle>>,
    embedder: Option<Arc<dyn EmbeddingOracle>>,
    store: Option<Arc<dyn MemoryStore>>,
    documents: Option<Arc<dyn DocumentStore>>,
    config: Option<PipelineConfig>,
}

impl MemoryPipelineBuilder {
    #[must_use]
    pub fn sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = Some(sources);
        self
    }

    #[must_use]
    pub fn document_builder(mut self, builder: DocumentBuilder) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Chat oracle for extraction, consolidation, and planning. Without
    /// one, only `basic`/`chunking` ingest steps are available.
    #[must_use]
    pub fn chat_oracle(mut self, chat: Arc<dyn ChatOracle>) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Like [`Self::chat_oracle`], accepting the optional form callers
    /// resolve from the environment.
    #[must_use]
    pub fn chat_oracle_opt(mut self, chat: Option<Arc<dyn ChatOracle>>) -> Self {
        self.chat = chat;
        self
    }

    #[must_use]
    pub fn embedding_oracle(mut self, embedder: Arc<dyn EmbeddingOracle>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn document_store(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the pipeline. The embedding oracle, memory store, and
    /// document store are required.
    pub fn build(self) -> Result<MemoryPipeline, PipelineError> {
        let embedder = self
            .embedder
            .ok_or_else(|| PipelineError::config("an embedding oracle is required"))?;
        let store = self
            .store
            .ok_or_else(|| PipelineError::config("a memory store is required"))?;
        let documents = self
            .documents
            .ok_or_else(|| PipelineError::config("a document store is required"))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let runner = PipelineRunner::new(config.semaphore_size);
        Ok(MemoryPipeline {
            sources: self.sources.unwrap_or_else(SourceRegistry::with_defaults),
            builder: self
                .builder
                .unwrap_or_else(|| DocumentBuilder::with_defaults(UsernameResolver::default())),
            chat: self.chat,
            embedder,
            store,
            documents,
            config,
            runner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::stub::{HashEmbeddingOracle, StubChatOracle};
    use crate::progress::NullProgress;
    use crate::store::memory::InMemoryStore;
    use chrono::Utc;

    const DIM: usize = 64;

    fn pipeline_with(chat: StubChatOracle) -> (MemoryPipeline, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new(
            Arc::new(HashEmbeddingOracle::new(DIM)),
            DIM,
        ));
        let pipeline = MemoryPipeline::builder()
            .chat_oracle(Arc::new(chat))
            .embedding_oracle(Arc::new(HashEmbeddingOracle::new(DIM)))
            .memory_store(Arc::clone(&store) as Arc<dyn MemoryStore>)
            .document_store(Arc::clone(&store) as Arc<dyn DocumentStore>)
            .config(
                PipelineConfig::default()
                    .with_embedding_dim(DIM)
                    .without_delays(),
            )
            .build()
            .unwrap();
        (pipeline, store)
    }

    fn extract_then_add(chat_payload: &str) -> StubChatOracle {
        // First call extracts, subsequent calls consolidate.
        let payload = chat_payload.to_string();
        StubChatOracle::with_handler(move |req| {
            let system = &req.messages[0].content;
            if system.contains("extract atomic facts") {
                Ok(crate::oracle::CompletionResponse::text(payload.clone()))
            } else {
                Ok(crate::oracle::CompletionResponse::text(r#"{"action": "ADD"}"#))
            }
        })
    }

    #[tokio::test]
    async fn store_documents_commits_facts() {
        let (pipeline, store) =
            pipeline_with(extract_then_add(r#"{"facts": ["Alice lives in Paris."]}"#));
        let doc = Document::text("notes:a", "notes", Utc::now(), "Alice lives in Paris.");
        let report = pipeline
            .store_documents(&[doc], &NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.documents, 1);
        assert_eq!(report.chunks, 1);
        assert_eq!(report.facts_extracted, 1);
        assert_eq!(report.added, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn oracle_failure_for_one_chunk_spares_the_rest() {
        let chat = StubChatOracle::with_handler(|req| {
            let system = &req.messages[0].content;
            let user = &req.messages[1].content;
            if system.contains("extract atomic facts") {
                if user.contains("poison") {
                    return Err(crate::error::OracleError::Transport {
                        message: "unreachable".into(),
                    });
                }
                let facts = serde_json::json!({ "facts": [user.trim()] });
                return Ok(crate::oracle::CompletionResponse::text(facts.to_string()));
            }
            Ok(crate::oracle::CompletionResponse::text(r#"{"action": "ADD"}"#))
        });
        let store = Arc::new(InMemoryStore::new(
            Arc::new(HashEmbeddingOracle::new(DIM)),
            DIM,
        ));
        let pipeline = MemoryPipeline::builder()
            .chat_oracle(Arc::new(chat))
            .embedding_oracle(Arc::new(HashEmbeddingOracle::new(DIM)))
            .memory_store(Arc::clone(&store) as Arc<dyn MemoryStore>)
            .document_store(Arc::clone(&store) as Arc<dyn DocumentStore>)
            .config(
                PipelineConfig {
                    // One chunk per batch, and no retries so the
                    // transport failure is persistent.
                    batch_size: 1,
                    max_retries: 0,
                    max_neighbor_distance: 2.0,
                    ..PipelineConfig::default()
                }
                .with_embedding_dim(DIM)
                .without_delays(),
            )
            .build()
            .unwrap();

        let documents = vec![
            Document::text("notes:a", "notes", Utc::now(), "Alice lives in Paris."),
            Document::text("notes:b", "notes", Utc::now(), "poison pill"),
            Document::text("notes:c", "notes", Utc::now(), "Bob plays chess."),
        ];
        let report = pipeline
            .store_documents(&documents, &NullProgress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.facts_extracted, 2);
        assert_eq!(report.added, 2);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("notes:b#0"));
        assert!(!report.cancelled);
        assert_eq!(report.exit_code(), 3);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_chat_oracle_disables_extraction() {
        let store = Arc::new(InMemoryStore::new(
            Arc::new(HashEmbeddingOracle::new(DIM)),
            DIM,
        ));
        let pipeline = MemoryPipeline::builder()
            .embedding_oracle(Arc::new(HashEmbeddingOracle::new(DIM)))
            .memory_store(Arc::clone(&store) as Arc<dyn MemoryStore>)
            .document_store(store as Arc<dyn DocumentStore>)
            .build()
            .unwrap();
        let doc = Document::text("notes:a", "notes", Utc::now(), "body");
        let err = pipeline
            .store_documents(&[doc], &NullProgress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn steps_parse_from_str() {
        assert_eq!("basic".parse::<IngestSteps>().unwrap(), IngestSteps::Basic);
        assert_eq!("ALL".parse::<IngestSteps>().unwrap(), IngestSteps::All);
        assert!("bogus".parse::<IngestSteps>().is_err());
        assert!(IngestSteps::Extraction.includes_chunking());
        assert!(!IngestSteps::Chunking.includes_extraction());
    }

    #[tokio::test]
    async fn exit_codes_reflect_warnings_and_cancellation() {
        let mut report = IngestReport::default();
        assert_eq!(report.exit_code(), 0);
        report.warnings.push("w".into());
        assert_eq!(report.exit_code(), 3);
        report.cancelled = true;
        assert_eq!(report.exit_code(), 1);
    }
}
