//! `memloom` CLI: the ingest driver.
//!
//! Exit codes: 0 success, 2 configuration/argument error, 3 partial
//! success with non-fatal errors, 1 fatal error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use memloom::config::{ENV_DB_PATH, OracleConfig, PipelineConfig};
use memloom::oracle::openai::{OpenAiChatOracle, OpenAiEmbeddingOracle};
use memloom::oracle::stub::HashEmbeddingOracle;
use memloom::oracle::{ChatOracle, EmbeddingOracle};
use memloom::pipeline::{IngestOptions, IngestSteps, MemoryPipeline};
use memloom::progress::TracingProgress;
use memloom::store::memory::InMemoryStore;
use memloom::store::sqlite::SqliteMemoryStore;
use memloom::store::{DocumentStore, MemoryStore};

#[derive(Parser)]
#[command(name = "memloom", version, about = "Evolving memory pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one source export into the memory store.
    Ingest {
        /// Source adapter name (chat_export, mailbox, notes).
        #[arg(long)]
        source: String,
        /// Export file or directory.
        #[arg(long)]
        input: PathBuf,
        /// Directory for JSON debug artifacts.
        #[arg(long)]
        output: Option<PathBuf>,
        /// How far to run the pipeline.
        #[arg(long, value_enum, default_value_t = StepsArg::All)]
        steps: StepsArg,
    },
    /// Ask a question against the memory store.
    Query {
        question: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StepsArg {
    Basic,
    Chunking,
    Extraction,
    All,
}

impl From<StepsArg> for IngestSteps {
    fn from(arg: StepsArg) -> Self {
        match arg {
            StepsArg::Basic => IngestSteps::Basic,
            StepsArg::Chunking => IngestSteps::Chunking,
            StepsArg::Extraction => IngestSteps::Extraction,
            StepsArg::All => IngestSteps::All,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, error_kind = err.kind(), "fatal");
            match err.kind() {
                "config" => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, memloom::PipelineError> {
    let oracle_config = OracleConfig::from_env()?;
    let pipeline = build_pipeline(&oracle_config).await?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling at the next suspension point");
            signal_token.cancel();
        }
    });

    match cli.command {
        Command::Ingest {
            source,
            input,
            output,
            steps,
        } => {
            let steps: IngestSteps = steps.into();
            if steps.includes_extraction() && !oracle_config.has_credentials() {
                return Err(memloom::PipelineError::config(
                    "fact extraction requires MEMLOOM_LLM_API_KEY; \
                     run with --steps basic or chunking to skip it",
                ));
            }
            let options = IngestOptions {
                output_dir: output,
                steps,
            };
            let report = pipeline
                .ingest(&source, &input, &options, &TracingProgress, &cancel)
                .await?;
            info!(
                documents = report.documents,
                chunks = report.chunks,
                facts = report.facts_extracted,
                added = report.added,
                updated = report.updated,
                deleted = report.deleted,
                dropped = report.dropped,
                warnings = report.warnings.len(),
                cancelled = report.cancelled,
                "ingest finished"
            );
            Ok(ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1)))
        }
        Command::Query { question } => {
            let outcome = pipeline.query(&question, &cancel).await?;
            for entry in &outcome.entries {
                println!("{}\t{}", entry.updated_at.to_rfc3339(), entry.content);
            }
            for doc in &outcome.documents {
                println!("[{}] {}", doc.document_id, doc.snippet);
            }
            for aggregate in &outcome.aggregates {
                println!("{aggregate}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build_pipeline(
    oracle_config: &OracleConfig,
) -> Result<MemoryPipeline, memloom::PipelineError> {
    let config = PipelineConfig {
        embedding_dim: oracle_config.embedding_dim,
        ..PipelineConfig::default()
    };

    let (chat, embedder): (Option<Arc<dyn ChatOracle>>, Arc<dyn EmbeddingOracle>) =
        if oracle_config.has_credentials() {
            let chat = OpenAiChatOracle::from_config(oracle_config)
                .map_err(memloom::PipelineError::from)?;
            let embedder = OpenAiEmbeddingOracle::from_config(oracle_config)
                .map_err(memloom::PipelineError::from)?;
            (Some(Arc::new(chat) as Arc<dyn ChatOracle>), Arc::new(embedder))
        } else {
            // Offline: deterministic embeddings, no chat oracle.
            (None, Arc::new(HashEmbeddingOracle::new(config.embedding_dim)))
        };

    let (store, documents): (Arc<dyn MemoryStore>, Arc<dyn DocumentStore>) =
        match std::env::var(ENV_DB_PATH) {
            Ok(path) => {
                let store = Arc::new(
                    SqliteMemoryStore::open(&path, Arc::clone(&embedder), config.embedding_dim)
                        .await?,
                );
                info!(path = %path, "opened sqlite memory store");
                (
                    Arc::clone(&store) as Arc<dyn MemoryStore>,
                    store as Arc<dyn DocumentStore>,
                )
            }
            Err(_) => {
                info!("MEMLOOM_DB_PATH unset, using in-memory store");
                let store = Arc::new(InMemoryStore::new(
                    Arc::clone(&embedder),
                    config.embedding_dim,
                ));
                (
                    Arc::clone(&store) as Arc<dyn MemoryStore>,
                    store as Arc<dyn DocumentStore>,
                )
            }
        };

    MemoryPipeline::builder()
        .chat_oracle_opt(chat)
        .embedding_oracle(embedder)
        .memory_store(store)
        .document_store(documents)
        .config(config)
        .build()
}
