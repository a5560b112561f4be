//! LLM-assisted query planning with a deterministic fallback.
//!
//! The planner asks the chat oracle to classify a question into a
//! [`QueryIntent`]; any failure (no oracle configured, transport error,
//! unparseable output) falls back to a pure content search with no
//! filters, so retrieval always produces a plan.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Step;
use crate::config::PipelineConfig;
use crate::model::normalize_tag;
use crate::oracle::{ChatMessage, ChatOracle, CompletionRequest, RetryPolicy, complete_with_retry};
use crate::store::MemoryFilter;

/// System prompt for intent classification.
pub const PLANNER_SYSTEM_PROMPT: &str = "\
You classify questions against a personal memory store. Respond with JSON:
{\"intent_type\": \"pending_action|content_search|relationship_query\",
 \"temporal_context\": {\"start\": null, \"end\": null},
 \"entities\": [{\"type\": \"person|place|topic\", \"value\": \"...\", \"role\": null}],
 \"content_type\": null,
 \"action_required\": null}
Timestamps are RFC 3339. Only include entities named in the question.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    PendingAction,
    ContentSearch,
    RelationshipQuery,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalContext {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Classified question, ready for compilation into steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryIntent {
    pub intent_type: IntentType,
    #[serde(default)]
    pub temporal_context: Option<TemporalContext>,
    #[serde(default)]
    pub entities: Vec<EntityRef>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub action_required: Option<bool>,
}

impl QueryIntent {
    /// The fallback intent: pure content search, no filters.
    #[must_use]
    pub fn content_search() -> Self {
        Self {
            intent_type: IntentType::ContentSearch,
            temporal_context: None,
            entities: Vec::new(),
            content_type: None,
            action_required: None,
        }
    }
}

/// Produces [`QueryIntent`]s and compiles them into [`Step`]s.
pub struct RetrievalPlanner {
    chat: Option<Arc<dyn ChatOracle>>,
    policy: RetryPolicy,
    fence: Regex,
}

impl RetrievalPlanner {
    #[must_use]
    pub fn new(chat: Arc<dyn ChatOracle>, config: &PipelineConfig) -> Self {
        Self {
            chat: Some(chat),
            policy: RetryPolicy::from_config(config),
            fence: fence_regex(),
        }
    }

    /// Planner without an oracle: every question becomes a content search.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            chat: None,
            policy: RetryPolicy::from_config(&PipelineConfig::default()),
            fence: fence_regex(),
        }
    }

    /// Classify `question`. Infallible: every failure path degrades to
    /// [`QueryIntent::content_search`].
    pub async fn plan(&self, question: &str, cancel: &CancellationToken) -> QueryIntent {
        let Some(chat) = &self.chat else {
            return QueryIntent::content_search();
        };
        let request = CompletionRequest::new(vec![
            ChatMessage::system(PLANNER_SYSTEM_PROMPT),
            ChatMessage::user(question.to_string()),
        ])
        .expecting_json();

        let response = match complete_with_retry(chat.as_ref(), &request, &self.policy, cancel).await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "intent planning failed, falling back to content search");
                return QueryIntent::content_search();
            }
        };

        match self.parse_intent(&response.content) {
            Some(intent) => intent,
            None => {
                warn!("unparseable intent, falling back to content search");
                QueryIntent::content_search()
            }
        }
    }

    fn parse_intent(&self, content: &str) -> Option<QueryIntent> {
        let trimmed = content.trim();
        let body = self
            .fence
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .map_or(trimmed, |m| m.as_str());
        serde_json::from_str(body).ok()
    }

    /// Compile an intent into an ordered step list.
    ///
    /// Every plan starts with a `filter_memories` step; intents that need
    /// source context (pending actions, relationship queries) add a
    /// `check_conversations` step over its results.
    #[must_use]
    pub fn compile(&self, intent: &QueryIntent, question: &str) -> Vec<Step> {
        let mut filter = MemoryFilter::default();

        if let Some(temporal) = &intent.temporal_context {
            filter.timestamp_after = temporal.start;
            filter.timestamp_before = temporal.end;
        }
        for entity in &intent.entities {
            match entity.entity_type.as_str() {
                "person" => {
                    if entity.role.as_deref() == Some("subject") {
                        filter.subject.get_or_insert_with(|| entity.value.clone());
                    } else {
                        filter
                            .contact_name
                            .get_or_insert_with(|| entity.value.clone());
                    }
                }
                "topic" => {
                    if let Some(tag) = normalize_tag(&entity.value) {
                        filter.tags_any.push(tag);
                    }
                }
                _ => {}
            }
        }
        if let Some(content_type) = &intent.content_type {
            if let Some(tag) = normalize_tag(content_type) {
                filter.tags_any.push(tag);
            }
        }

        let mut steps = vec![Step::FilterMemories {
            query_text: question.to_string(),
            filter,
        }];
        if matches!(
            intent.intent_type,
            IntentType::PendingAction | IntentType::RelationshipQuery
        ) || intent.action_required == Some(true)
        {
            steps.push(Step::CheckConversations { depends_on: vec![0] });
        }
        debug!(steps = steps.len(), intent = ?intent.intent_type, "compiled retrieval plan");
        steps
    }
}

fn fence_regex() -> Regex {
    Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("static regex")
}
