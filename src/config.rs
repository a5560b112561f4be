//! Pipeline and oracle configuration.
//!
//! [`PipelineConfig`] carries every tunable the pipeline stages read:
//! chunking bounds, batching bounds, concurrency caps, retry policy, and
//! the similarity gate for consolidation. Defaults match the production
//! deployment; builder-style setters override individual knobs.
//!
//! [`OracleConfig`] is resolved from the environment by the binary. A
//! missing API key is not fatal here: extraction-dependent steps are
//! disabled later with a clear error instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Environment variable names read by [`OracleConfig::from_env`].
pub const ENV_LLM_BASE_URL: &str = "MEMLOOM_LLM_BASE_URL";
pub const ENV_LLM_API_KEY: &str = "MEMLOOM_LLM_API_KEY";
pub const ENV_LLM_MODEL: &str = "MEMLOOM_LLM_MODEL";
pub const ENV_EMBED_MODEL: &str = "MEMLOOM_EMBED_MODEL";
pub const ENV_EMBED_DIM: &str = "MEMLOOM_EMBED_DIM";
pub const ENV_DB_PATH: &str = "MEMLOOM_DB_PATH";

/// Tunables for every pipeline stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on a chunk's textual serialization, in characters.
    pub max_chunk_chars: usize,
    /// Facts kept per chunk after dedupe; the rest are discarded.
    pub max_facts_per_chunk: usize,
    /// Item-count bound for one batch.
    pub batch_size: usize,
    /// Aggregate text-length bound for one batch, in characters.
    pub max_batch_text_len: usize,
    /// In-flight batch cap for the runner semaphore.
    pub semaphore_size: usize,
    /// Retries after the first attempt, for transport-shaped oracle errors.
    pub max_retries: u32,
    /// Fixed delay between retry attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-attempt deadline for one oracle call, in seconds.
    pub llm_timeout_secs: u64,
    /// Deadline for one retrieval, in seconds.
    pub query_timeout_secs: u64,
    /// Overall deadline for one `store` invocation, in seconds.
    pub store_timeout_secs: u64,
    /// Wait after a commit before the next neighbor query, in milliseconds.
    /// Best effort against async-indexing backends; zero disables it.
    pub settle_delay_ms: u64,
    /// Nearest neighbors fetched for each consolidation decision.
    pub neighbor_k: usize,
    /// Cosine-distance gate for consolidation neighbors.
    pub max_neighbor_distance: f32,
    /// Fixed embedding dimension of the store.
    pub embedding_dim: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 8_000,
            max_facts_per_chunk: 50,
            batch_size: 30,
            max_batch_text_len: 8_192,
            semaphore_size: 3,
            max_retries: 2,
            retry_delay_ms: 1_000,
            llm_timeout_secs: 60,
            query_timeout_secs: 60,
            store_timeout_secs: 30 * 60,
            settle_delay_ms: 1_000,
            neighbor_k: 10,
            max_neighbor_distance: 0.15,
            embedding_dim: 1_536,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub fn with_max_chunk_chars(mut self, chars: usize) -> Self {
        self.max_chunk_chars = chars;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn with_max_batch_text_len(mut self, chars: usize) -> Self {
        self.max_batch_text_len = chars;
        self
    }

    #[must_use]
    pub fn with_semaphore_size(mut self, permits: usize) -> Self {
        self.semaphore_size = permits;
        self
    }

    #[must_use]
    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    /// Zeroes the settle delay and retry delay. Intended for tests and
    /// deterministic offline runs.
    #[must_use]
    pub fn without_delays(mut self) -> Self {
        self.settle_delay_ms = 0;
        self.retry_delay_ms = 0;
        self
    }

    /// Reject configurations that would wedge the pipeline outright.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_chunk_chars == 0 {
            return Err(PipelineError::config("max_chunk_chars must be positive"));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::config("batch_size must be positive"));
        }
        if self.semaphore_size == 0 {
            return Err(PipelineError::config("semaphore_size must be positive"));
        }
        if self.embedding_dim == 0 {
            return Err(PipelineError::config("embedding_dim must be positive"));
        }
        if !(0.0..=2.0).contains(&self.max_neighbor_distance) {
            return Err(PipelineError::config(
                "max_neighbor_distance must lie in [0, 2] for cosine distance",
            ));
        }
        Ok(())
    }
}

/// Endpoint, credentials, and model names for the two oracles.
#[derive(Clone, Debug)]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embed_model: String,
    pub embedding_dim: usize,
}

impl OracleConfig {
    /// Resolve oracle settings from the process environment.
    ///
    /// Only the base URL has a hard default; a missing API key leaves
    /// `api_key` as `None` so callers can disable extraction instead of
    /// crashing.
    pub fn from_env() -> Result<Self, PipelineError> {
        let base_url = std::env::var(ENV_LLM_BASE_URL)
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var(ENV_LLM_API_KEY)
            .ok()
            .filter(|k| !k.trim().is_empty());
        let chat_model =
            std::env::var(ENV_LLM_MODEL).unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let embed_model = std::env::var(ENV_EMBED_MODEL)
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let embedding_dim = match std::env::var(ENV_EMBED_DIM) {
            Ok(raw) => raw.parse::<usize>().map_err(|_| {
                PipelineError::config(format!("{ENV_EMBED_DIM} must be a positive integer: {raw}"))
            })?,
            Err(_) => 1_536,
        };
        Ok(Self {
            base_url,
            api_key,
            chat_model,
            embed_model,
            embedding_dim,
        })
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_chunk_chars, 8_000);
        assert_eq!(cfg.batch_size, 30);
        assert_eq!(cfg.max_batch_text_len, 8_192);
        assert_eq!(cfg.semaphore_size, 3);
        assert_eq!(cfg.neighbor_k, 10);
        assert_eq!(cfg.embedding_dim, 1_536);
        assert_eq!(cfg.llm_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.store_timeout(), Duration::from_secs(1_800));
        assert!((cfg.max_neighbor_distance - 0.15).abs() < f32::EPSILON);
        cfg.validate().expect("defaults must validate");
    }

    #[test]
    fn validation_rejects_zero_bounds() {
        assert!(
            PipelineConfig::default()
                .with_max_chunk_chars(0)
                .validate()
                .is_err()
        );
        assert!(
            PipelineConfig::default()
                .with_batch_size(0)
                .validate()
                .is_err()
        );
        assert!(
            PipelineConfig::default()
                .with_semaphore_size(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn serde_round_trip_with_defaults() {
        let parsed: PipelineConfig = serde_json::from_str(r#"{"batch_size": 5}"#).unwrap();
        assert_eq!(parsed.batch_size, 5);
        assert_eq!(parsed.max_chunk_chars, 8_000);
    }
}
