//! Fact extraction: one LLM call per chunk, tolerant post-processing.
//!
//! The oracle is asked for `{"facts": [...]}` as JSON; items may be bare
//! strings or objects carrying a triple and confidence. Parsing strips
//! code fences and accepts bare arrays. Malformed output after the final
//! retry yields zero facts plus a warning, never a pipeline failure.

use std::sync::Arc;

use regex::Regex;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{OracleError, PipelineError};
use crate::model::{Document, Fact};
use crate::oracle::{
    ChatMessage, ChatOracle, CompletionRequest, RetryPolicy, complete_with_retry,
};

/// System prompt defining what counts as an atomic fact.
pub const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract atomic facts from personal data. An atomic fact is a single, \
self-contained statement that is true independent of the surrounding text: \
it names its subject explicitly and never uses pronouns that need context. \
Extract only information worth remembering about people, places, events, \
preferences, plans, and commitments. Skip greetings, filler, and anything \
already implied by another extracted fact.

Respond with JSON of the form {\"facts\": [...]}. Each item is either a \
plain string or an object {\"content\", \"subject\", \"predicate\", \
\"object\", \"confidence\"} where confidence lies in [0, 1].";

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFactItem {
    Plain(String),
    Structured {
        content: String,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        predicate: Option<String>,
        #[serde(default)]
        object: Option<String>,
        #[serde(default)]
        confidence: Option<f32>,
    },
}

#[derive(Deserialize)]
struct RawFactList {
    facts: Vec<RawFactItem>,
}

/// Extraction result for one chunk: the surviving facts plus any
/// non-fatal warnings the caller should count.
#[derive(Debug, Default)]
pub struct ChunkExtraction {
    pub facts: Vec<Fact>,
    pub warnings: Vec<String>,
}

/// Extracts atomic facts from chunks through the chat oracle.
pub struct FactExtractor {
    oracle: Arc<dyn ChatOracle>,
    policy: RetryPolicy,
    max_facts_per_chunk: usize,
    fence: Regex,
}

impl FactExtractor {
    #[must_use]
    pub fn new(oracle: Arc<dyn ChatOracle>, config: &PipelineConfig) -> Self {
        Self {
            oracle,
            policy: RetryPolicy::from_config(config),
            max_facts_per_chunk: config.max_facts_per_chunk,
            fence: Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("static regex"),
        }
    }

    /// Extract facts from one chunk.
    ///
    /// Transport failures that survive the retry policy surface as
    /// [`PipelineError::Oracle`]; malformed model output degrades to an
    /// empty extraction with a warning.
    pub async fn extract(
        &self,
        chunk: &Document,
        cancel: &CancellationToken,
    ) -> Result<ChunkExtraction, PipelineError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user(chunk.content_text()),
        ])
        .expecting_json();

        let response = match complete_with_retry(self.oracle.as_ref(), &request, &self.policy, cancel)
            .await
        {
            Ok(response) => response,
            Err(OracleError::Malformed { message }) => {
                warn!(chunk_id = %chunk.id, error = %message, "extraction response unusable");
                return Ok(ChunkExtraction {
                    facts: Vec::new(),
                    warnings: vec![format!("extraction failed for {}: {message}", chunk.id)],
                });
            }
            Err(err) => return Err(err.into()),
        };

        match self.parse_items(&response.content) {
            Ok(items) => Ok(self.post_process(chunk, items)),
            Err(message) => {
                warn!(chunk_id = %chunk.id, error = %message, "extraction output malformed");
                Ok(ChunkExtraction {
                    facts: Vec::new(),
                    warnings: vec![format!("unparseable facts for {}: {message}", chunk.id)],
                })
            }
        }
    }

    /// Tolerant decode: strip code fences, accept `{"facts": [...]}` or a
    /// bare array.
    fn parse_items(&self, content: &str) -> Result<Vec<RawFactItem>, String> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err("empty response".to_string());
        }
        let body = self
            .fence
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .map_or(trimmed, |m| m.as_str());

        if let Ok(list) = serde_json::from_str::<RawFactList>(body) {
            return Ok(list.facts);
        }
        if let Ok(items) = serde_json::from_str::<Vec<RawFactItem>>(body) {
            return Ok(items);
        }
        Err(format!(
            "expected {{\"facts\": [...]}} or an array, got: {}",
            &body.chars().take(80).collect::<String>()
        ))
    }

    fn post_process(&self, chunk: &Document, items: Vec<RawFactItem>) -> ChunkExtraction {
        let mut seen = FxHashSet::default();
        let mut facts = Vec::new();
        let mut truncated = 0usize;

        for item in items {
            let fact = match item {
                RawFactItem::Plain(content) => Fact::observed_in(chunk, content.trim()),
                RawFactItem::Structured {
                    content,
                    subject,
                    predicate,
                    object,
                    confidence,
                } => Fact::observed_in(chunk, content.trim())
                    .with_triple(subject, predicate, object)
                    .with_confidence(confidence.unwrap_or(1.0)),
            };
            if fact.content.is_empty() {
                continue;
            }
            if !seen.insert(fact.normalized_content()) {
                continue;
            }
            if facts.len() >= self.max_facts_per_chunk {
                truncated += 1;
                continue;
            }
            facts.push(fact);
        }

        let mut warnings = Vec::new();
        if truncated > 0 {
            warnings.push(format!(
                "chunk {} produced {truncated} facts beyond the per-chunk cap",
                chunk.id
            ));
        }
        debug!(chunk_id = %chunk.id, count = facts.len(), "extracted facts");
        ChunkExtraction { facts, warnings }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::CompletionResponse;
    use crate::oracle::stub::StubChatOracle;
    use chrono::Utc;

    fn chunk() -> Document {
        Document::text("notes:abc#0", "notes", Utc::now(), "Alice lives in Paris.")
    }

    fn extractor(oracle: StubChatOracle) -> FactExtractor {
        FactExtractor::new(
            Arc::new(oracle),
            &PipelineConfig::default().without_delays(),
        )
    }

    #[tokio::test]
    async fn parses_fact_object() {
        let oracle =
            StubChatOracle::always(r#"{"facts": ["Alice lives in Paris.", "Alice likes tea."]}"#);
        let out = extractor(oracle)
            .extract(&chunk(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.facts.len(), 2);
        assert!(out.warnings.is_empty());
        assert_eq!(out.facts[0].content, "Alice lives in Paris.");
        assert_eq!(out.facts[0].document_references, vec!["notes:abc#0".to_string()]);
        assert_eq!(out.facts[0].source_document_id, "notes:abc");
    }

    #[tokio::test]
    async fn strips_code_fences_and_accepts_bare_arrays() {
        let oracle = StubChatOracle::always("```json\n[\"One fact.\"]\n```");
        let out = extractor(oracle)
            .extract(&chunk(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.facts[0].content, "One fact.");
    }

    #[tokio::test]
    async fn structured_items_carry_triples() {
        let oracle = StubChatOracle::always(
            r#"{"facts": [{"content": "Alice lives in Paris.", "subject": "Alice",
                 "predicate": "lives_in", "object": "Paris", "confidence": 0.9}]}"#,
        );
        let out = extractor(oracle)
            .extract(&chunk(), &CancellationToken::new())
            .await
            .unwrap();
        let fact = &out.facts[0];
        assert_eq!(fact.subject.as_deref(), Some("Alice"));
        assert_eq!(fact.predicate.as_deref(), Some("lives_in"));
        assert_eq!(fact.object.as_deref(), Some("Paris"));
        assert!((fact.confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn dedupes_and_drops_empties() {
        let oracle = StubChatOracle::always(
            r#"{"facts": ["Same fact.", "  same   FACT. ", "", "Other fact."]}"#,
        );
        let out = extractor(oracle)
            .extract(&chunk(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.facts.len(), 2);
    }

    #[tokio::test]
    async fn malformed_output_degrades_to_zero_facts() {
        let oracle = StubChatOracle::always("this is not json at all");
        let out = extractor(oracle)
            .extract(&chunk(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.facts.is_empty());
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn clamps_to_per_chunk_cap() {
        let many: Vec<String> = (0..60).map(|i| format!("Fact number {i}.")).collect();
        let payload = serde_json::json!({ "facts": many }).to_string();
        let oracle = StubChatOracle::always(payload);
        let out = extractor(oracle)
            .extract(&chunk(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.facts.len(), 50);
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_after_retries_is_fatal_for_the_item() {
        let oracle = StubChatOracle::with_handler(|_| {
            Err(OracleError::Transport {
                message: "unreachable".into(),
            })
        });
        let err = extractor(oracle)
            .extract(&chunk(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "oracle");
    }
}
