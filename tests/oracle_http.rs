//! HTTP oracle bindings against a mock OpenAI-compatible endpoint.

use httpmock::prelude::*;

use memloom::config::OracleConfig;
use memloom::error::OracleError;
use memloom::oracle::openai::{OpenAiChatOracle, OpenAiEmbeddingOracle};
use memloom::oracle::{ChatMessage, ChatOracle, CompletionRequest, EmbeddingOracle};

fn config_for(server: &MockServer) -> OracleConfig {
    OracleConfig {
        base_url: server.url("/v1"),
        api_key: Some("test-key".to_string()),
        chat_model: "test-chat".to_string(),
        embed_model: "test-embed".to_string(),
        embedding_dim: 8,
    }
}

#[tokio::test]
async fn chat_completion_round_trip() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer test-key");
            then.status(200).json_body(serde_json::json!({
                "choices": [{
                    "message": {
                        "content": "{\"facts\": [\"Alice lives in Paris.\"]}"
                    }
                }]
            }));
        })
        .await;

    let oracle = OpenAiChatOracle::from_config(&config_for(&server)).unwrap();
    let response = oracle
        .complete(
            CompletionRequest::new(vec![
                ChatMessage::system("extract"),
                ChatMessage::user("Alice lives in Paris."),
            ])
            .expecting_json(),
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert!(response.content.contains("Alice lives in Paris."));
    assert!(response.tool_calls.is_empty());
}

#[tokio::test]
async fn tool_calls_are_decoded() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "function": {
                                "name": "filter_memories",
                                "arguments": "{\"query\": \"alice\"}"
                            }
                        }]
                    }
                }]
            }));
        })
        .await;

    let oracle = OpenAiChatOracle::from_config(&config_for(&server)).unwrap();
    let response = oracle
        .complete(CompletionRequest::new(vec![ChatMessage::user("q")]))
        .await
        .unwrap();
    assert_eq!(response.content, "");
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "filter_memories");
    assert_eq!(response.tool_calls[0].arguments["query"], "alice");
}

#[tokio::test]
async fn server_errors_surface_with_status() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("overloaded");
        })
        .await;

    let oracle = OpenAiChatOracle::from_config(&config_for(&server)).unwrap();
    let err = oracle
        .complete(CompletionRequest::new(vec![ChatMessage::user("q")]))
        .await
        .unwrap_err();
    match err {
        OracleError::Status { status, .. } => {
            assert_eq!(status, 503);
            assert!(err.is_retryable());
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn embeddings_restore_input_order() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200).json_body(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            }));
        })
        .await;

    let oracle = OpenAiEmbeddingOracle::from_config(&config_for(&server)).unwrap();
    let vectors = oracle
        .embed(&["first".to_string(), "second".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors[0], vec![1.0, 0.0]);
    assert_eq!(vectors[1], vec![0.0, 1.0]);
}

#[tokio::test]
async fn embedding_count_mismatch_is_malformed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200)
                .json_body(serde_json::json!({"data": [{"index": 0, "embedding": [1.0]}]}));
        })
        .await;

    let oracle = OpenAiEmbeddingOracle::from_config(&config_for(&server)).unwrap();
    let err = oracle
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::Malformed { .. }));
}

#[test]
fn missing_credentials_are_rejected() {
    let config = OracleConfig {
        base_url: "http://localhost".to_string(),
        api_key: None,
        chat_model: "m".to_string(),
        embed_model: "m".to_string(),
        embedding_dim: 8,
    };
    assert!(matches!(
        OpenAiChatOracle::from_config(&config),
        Err(OracleError::MissingCredentials { .. })
    ));
    assert!(matches!(
        OpenAiEmbeddingOracle::from_config(&config),
        Err(OracleError::MissingCredentials { .. })
    ));
}
