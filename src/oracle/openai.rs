//! OpenAI-compatible HTTP bindings for the chat and embedding oracles.
//!
//! Both clients speak the `/chat/completions` and `/embeddings` wire
//! shapes, which most hosted and local endpoints accept. The per-attempt
//! deadline and retry loop live with the caller; these bindings perform
//! exactly one request per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatOracle, CompletionRequest, CompletionResponse, EmbeddingOracle, ToolCall};
use crate::config::OracleConfig;
use crate::error::OracleError;

#[derive(Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: &'a [super::ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool<'a>>>,
}

#[derive(Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a super::ToolSpec,
}

#[derive(Deserialize)]
struct WireChatResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Deserialize)]
struct WireFunctionCall {
    name: String,
    /// Arrives as a JSON-encoded string per the wire contract.
    arguments: String,
}

#[derive(Serialize)]
struct WireEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbeddingDatum>,
}

#[derive(Deserialize)]
struct WireEmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Chat oracle backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiChatOracle {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatOracle {
    /// Build from resolved configuration. Fails when no API key is set;
    /// callers that can run without extraction check
    /// [`OracleConfig::has_credentials`] first.
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or(OracleError::MissingCredentials { what: "LLM API key" })?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.chat_model.clone(),
        })
    }
}

#[async_trait]
impl ChatOracle for OpenAiChatOracle {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, OracleError> {
        let tools: Option<Vec<WireTool<'_>>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function",
                        function: t,
                    })
                    .collect(),
            )
        };
        let body = WireChatRequest {
            model: &self.model,
            messages: &request.messages,
            response_format: request
                .json_response
                .then_some(WireResponseFormat { kind: "json_object" }),
            tools,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| OracleError::Transport {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let wire: WireChatResponse = response.json().await.map_err(|err| OracleError::Malformed {
            message: err.to_string(),
        })?;
        let choice = wire.choices.into_iter().next().ok_or(OracleError::Malformed {
            message: "response carried no choices".into(),
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Null);
                ToolCall {
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}

/// Embedding oracle backed by an OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbeddingOracle {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddingOracle {
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = config.api_key.clone().ok_or(OracleError::MissingCredentials {
            what: "embedding API key",
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.embed_model.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingOracle for OpenAiEmbeddingOracle {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = WireEmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| OracleError::Transport {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let wire: WireEmbeddingResponse =
            response.json().await.map_err(|err| OracleError::Malformed {
                message: err.to_string(),
            })?;
        if wire.data.len() != texts.len() {
            return Err(OracleError::Malformed {
                message: format!(
                    "embedding count mismatch: sent {}, received {}",
                    texts.len(),
                    wire.data.len()
                ),
            });
        }

        // The endpoint may reorder; restore input order by index.
        let mut data = wire.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}
