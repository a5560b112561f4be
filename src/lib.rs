//! # memloom
//!
//! An evolving memory pipeline: heterogeneous personal-data exports are
//! ingested, normalized, and consolidated into a queryable long-term
//! memory for a personal assistant.
//!
//! ```text
//! Source exports ──► sources::SourceAdapter ──► Record stream
//!                                   │
//! Records ──► builder::DocumentBuilder ──► typed Documents
//!                                   │
//! Documents ──► chunker ──► bounded Chunks
//!                                   │
//! Chunks ──► extractor::FactExtractor ──► atomic Facts (LLM oracle)
//!                                   │
//! Facts ──► consolidator::Consolidator ──► ADD/UPDATE/DELETE/NONE
//!                                   │
//! store::MemoryStore (entries + embeddings + triples + tags)
//!                                   │
//! retrieval::RetrievalExecutor ──► merged answers
//! ```
//!
//! The [`pipeline::MemoryPipeline`] facade wires the stages together;
//! [`runner::PipelineRunner`] supplies the batching and concurrency
//! spine. External services appear only as the oracle traits in
//! [`oracle`]; deterministic stubs live in [`oracle::stub`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use memloom::oracle::stub::{HashEmbeddingOracle, StubChatOracle};
//! use memloom::pipeline::MemoryPipeline;
//! use memloom::store::memory::InMemoryStore;
//! use memloom::store::{DocumentStore, MemoryStore};
//!
//! # async fn example() -> Result<(), memloom::error::PipelineError> {
//! let embedder = Arc::new(HashEmbeddingOracle::new(1536));
//! let store = Arc::new(InMemoryStore::new(embedder.clone(), 1536));
//! let pipeline = MemoryPipeline::builder()
//!     .chat_oracle(Arc::new(StubChatOracle::always(r#"{"facts": []}"#)))
//!     .embedding_oracle(embedder)
//!     .memory_store(store.clone() as Arc<dyn MemoryStore>)
//!     .document_store(store as Arc<dyn DocumentStore>)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod builder;
pub mod chunker;
pub mod config;
pub mod consolidator;
pub mod error;
pub mod extractor;
pub mod model;
pub mod oracle;
pub mod pipeline;
pub mod progress;
pub mod retrieval;
pub mod runner;
pub mod sources;
pub mod store;

pub use config::{OracleConfig, PipelineConfig};
pub use error::{OracleError, PipelineError, StoreError};
pub use model::{Document, DocumentBody, Fact, Record, Turn};
pub use pipeline::{IngestOptions, IngestReport, IngestSteps, MemoryPipeline};
pub use progress::{PipelineStage, Progress, ProgressSink};
pub use store::{MemoryEntry, MemoryFilter, MemoryStore};
