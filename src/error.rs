//! Error taxonomy for the memory pipeline.
//!
//! Errors are layered: oracle and store failures have their own enums so
//! that retry policies can inspect them, and everything converges on
//! [`PipelineError`] at component boundaries. Item-level failures are
//! recovered locally, batch-level failures stop the batch, runner-level
//! failures stop the pipeline.

use miette::Diagnostic;
use thiserror::Error;

/// Failure of an LLM or embedding oracle call.
///
/// Only transport-shaped failures ([`OracleError::is_retryable`]) are
/// retried; everything else surfaces immediately.
#[derive(Debug, Error, Diagnostic)]
pub enum OracleError {
    /// Network-level failure before a response was received.
    #[error("oracle transport error: {message}")]
    #[diagnostic(code(memloom::oracle::transport))]
    Transport { message: String },

    /// Non-success HTTP status from the oracle endpoint.
    #[error("oracle returned status {status}: {message}")]
    #[diagnostic(code(memloom::oracle::status))]
    Status { status: u16, message: String },

    /// A single attempt exceeded its deadline.
    #[error("oracle call timed out after {seconds}s")]
    #[diagnostic(code(memloom::oracle::timeout))]
    Timeout { seconds: u64 },

    /// The response body could not be decoded into the expected shape.
    #[error("oracle response malformed: {message}")]
    #[diagnostic(
        code(memloom::oracle::malformed),
        help("The model returned output that is not parseable; the caller degrades to zero items.")
    )]
    Malformed { message: String },

    /// No credentials were configured for this oracle.
    #[error("oracle credentials missing: {what}")]
    #[diagnostic(
        code(memloom::oracle::credentials),
        help("Set the MEMLOOM_LLM_API_KEY environment variable or disable extraction steps.")
    )]
    MissingCredentials { what: &'static str },

    /// The surrounding operation was cancelled mid-call.
    #[error("oracle call cancelled")]
    #[diagnostic(code(memloom::oracle::cancelled))]
    Cancelled,
}

impl OracleError {
    /// Transport failures, 5xx statuses, and timeouts are worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Transport { .. } | OracleError::Timeout { .. } => true,
            OracleError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Failure inside a memory-store binding.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// Engine-level failure. `transient` failures are retried once per batch.
    #[error("store backend error: {message}")]
    #[diagnostic(code(memloom::store::backend))]
    Backend { message: String, transient: bool },

    /// Referenced entry does not exist.
    #[error("memory entry not found: {id}")]
    #[diagnostic(code(memloom::store::not_found))]
    NotFound { id: String },

    /// Row or payload could not be (de)serialized.
    #[error("store serialization error: {0}")]
    #[diagnostic(code(memloom::store::serde))]
    Serde(#[from] serde_json::Error),

    /// The store observed cancellation at a suspension point.
    #[error("store operation cancelled")]
    #[diagnostic(code(memloom::store::cancelled))]
    Cancelled,
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StoreError::Backend {
            message: message.into(),
            transient: true,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend { transient: true, .. })
    }
}

/// Top-level pipeline error, the shape every public method returns.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    /// Missing DSN, credentials, or model name. Fatal at startup.
    #[error("configuration error: {message}")]
    #[diagnostic(
        code(memloom::config),
        help("Check environment variables and CLI arguments.")
    )]
    Config { message: String },

    /// Malformed input file or API failure for one source.
    #[error("source error ({source_name}): {message}")]
    #[diagnostic(code(memloom::source))]
    Source {
        source_name: String,
        message: String,
    },

    /// Oracle call failed after all retries.
    #[error(transparent)]
    #[diagnostic(code(memloom::oracle))]
    Oracle(OracleError),

    /// Store failure that survived the in-batch retry.
    #[error(transparent)]
    #[diagnostic(code(memloom::store))]
    Store(StoreError),

    /// Schema or enum violation in LLM output; never fatal for the run.
    #[error("validation error: {message}")]
    #[diagnostic(code(memloom::validation))]
    Validation { message: String },

    /// Surfaced from a suspension point when the caller cancels.
    #[error("pipeline cancelled")]
    #[diagnostic(code(memloom::cancelled))]
    Cancelled,

    /// Filesystem failure reading inputs or writing artifacts.
    #[error("i/o error: {0}")]
    #[diagnostic(code(memloom::io))]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure outside the store.
    #[error("serialization error: {0}")]
    #[diagnostic(code(memloom::serde))]
    Serde(#[from] serde_json::Error),

    /// A worker task died unexpectedly; indicates a bug, not bad input.
    #[error("internal error: {message}")]
    #[diagnostic(code(memloom::internal))]
    Internal { message: String },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config {
            message: message.into(),
        }
    }

    pub fn source(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Source {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::Oracle(OracleError::Cancelled)
                | PipelineError::Store(StoreError::Cancelled)
        )
    }

    /// Short machine-readable kind used in structured log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config { .. } => "config",
            PipelineError::Source { .. } => "source",
            PipelineError::Oracle(_) => "oracle",
            PipelineError::Store(_) => "store",
            PipelineError::Validation { .. } => "validation",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Io(_) => "io",
            PipelineError::Serde(_) => "serde",
            PipelineError::Internal { .. } => "internal",
        }
    }
}

impl From<OracleError> for PipelineError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Oracle(other),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            OracleError::Transport {
                message: "reset".into()
            }
            .is_retryable()
        );
        assert!(
            OracleError::Status {
                status: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(
            !OracleError::Status {
                status: 400,
                message: "bad request".into()
            }
            .is_retryable()
        );
        assert!(
            !OracleError::Malformed {
                message: "not json".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn cancellation_coalesces() {
        let err: PipelineError = OracleError::Cancelled.into();
        assert!(err.is_cancelled());
        let err: PipelineError = StoreError::Cancelled.into();
        assert!(err.is_cancelled());
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn transient_store_errors() {
        assert!(StoreError::transient("db locked").is_transient());
        assert!(!StoreError::backend("corrupt page").is_transient());
    }
}
