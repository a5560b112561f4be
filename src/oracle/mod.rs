//! External oracle contracts.
//!
//! The pipeline consumes two pure request/response dependencies: a chat
//! oracle (LLM) and an embedding oracle. Both are trait seams with a
//! production HTTP binding ([`openai`]) and deterministic fakes
//! ([`stub`]); the core depends only on the traits.
//!
//! Retry discipline lives here too: [`complete_with_retry`] and
//! [`embed_with_retry`] wrap one logical call with per-attempt timeout,
//! fixed back-off, and cancellation observation. Only transport-shaped
//! failures are retried.

pub mod openai;
pub mod stub;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::OracleError;

/// One message in a chat completion request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A tool the model may call instead of answering in text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool arguments.
    pub parameters: serde_json::Value,
}

/// A tool invocation chosen by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One chat completion request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Ask the endpoint for `response_format = json_object`. Callers still
    /// parse tolerantly regardless.
    pub json_response: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            json_response: false,
            tools: Vec::new(),
        }
    }

    #[must_use]
    pub fn expecting_json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// Chat completion result: text content and any chosen tool calls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl CompletionResponse {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// The LLM oracle.
#[async_trait]
pub trait ChatOracle: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, OracleError>;
}

/// The embedding oracle. Returned vectors may have any dimension; the
/// store pads or truncates to its fixed dimension.
#[async_trait]
pub trait EmbeddingOracle: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError>;
}

/// Per-call retry policy: attempts after the first, fixed back-off, and a
/// per-attempt deadline.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &crate::config::PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            attempt_timeout: config.llm_timeout(),
        }
    }
}

/// Run one chat completion with retry/timeout/cancellation discipline.
pub async fn complete_with_retry(
    oracle: &dyn ChatOracle,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<CompletionResponse, OracleError> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(OracleError::Cancelled);
        }
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(OracleError::Cancelled),
            result = tokio::time::timeout(policy.attempt_timeout, oracle.complete(request.clone())) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(OracleError::Timeout {
                        seconds: policy.attempt_timeout.as_secs(),
                    }),
                }
            }
        };
        match outcome {
            Ok(response) => return Ok(response),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(attempt, error = %err, "chat oracle attempt failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(OracleError::Cancelled),
                    () = tokio::time::sleep(policy.retry_delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run one embedding call with the same discipline as [`complete_with_retry`].
pub async fn embed_with_retry(
    oracle: &dyn EmbeddingOracle,
    texts: &[String],
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>, OracleError> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(OracleError::Cancelled);
        }
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(OracleError::Cancelled),
            result = tokio::time::timeout(policy.attempt_timeout, oracle.embed(texts)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(OracleError::Timeout {
                        seconds: policy.attempt_timeout.as_secs(),
                    }),
                }
            }
        };
        match outcome {
            Ok(vectors) => return Ok(vectors),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                warn!(attempt, error = %err, "embedding oracle attempt failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(OracleError::Cancelled),
                    () = tokio::time::sleep(policy.retry_delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
