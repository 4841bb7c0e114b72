//! Integration tests for the gateways over a mocked Ollama server.
//!
//! Validates:
//! - The embedding gateway tags vectors with the provider that produced them
//! - A failing Ollama embedder degrades to the hashing fallback
//! - The analysis gateway parses a real `/api/chat` JSON reply
//! - HTTP failures from the chat endpoint surface as `Unavailable`

use std::sync::Arc;
use std::time::Duration;

use papertrail_core::{AnalysisError, AnalysisRequest, BreakerConfig, EmbeddingProvider};
use papertrail_inference::{
    AnalysisConfig, AnalysisGateway, EmbeddingGateway, HashEmbedder, OllamaBackend,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ollama(server: &MockServer) -> Arc<OllamaBackend> {
    Arc::new(OllamaBackend::with_config(
        server.uri(),
        "nomic-embed-text".to_string(),
        "qwen3:8b".to_string(),
        4,
    ))
}

fn request() -> AnalysisRequest {
    AnalysisRequest {
        item_id: "2401.00001".to_string(),
        title: "Sparse attention".to_string(),
        text: "We propose a sparse attention mechanism.".to_string(),
    }
}

#[tokio::test]
async fn test_embedding_gateway_uses_ollama() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embeddings": [[0.5, 0.5, 0.5, 0.5]]
        })))
        .mount(&server)
        .await;

    let gateway = EmbeddingGateway::new(
        ollama(&server),
        Arc::new(HashEmbedder::new()),
        BreakerConfig::default(),
    );
    let out = gateway.embed("sparse attention").await.unwrap();
    assert_eq!(out.provider, EmbeddingProvider::Primary);
    assert_eq!(out.model, "nomic-embed-text");
    assert_eq!(out.vector.len(), 4);
}

#[tokio::test]
async fn test_embedding_gateway_degrades_to_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .expect(3)
        .mount(&server)
        .await;

    let gateway = EmbeddingGateway::new(
        ollama(&server),
        Arc::new(HashEmbedder::new()),
        BreakerConfig::default()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_secs(300), Duration::from_secs(600)),
    );

    for _ in 0..5 {
        let out = gateway.embed("sparse attention").await.unwrap();
        assert_eq!(out.provider, EmbeddingProvider::Fallback);
    }
    // Only the first three calls reached the server.
    assert!(!gateway.is_primary_available());
}

#[tokio::test]
async fn test_analysis_gateway_parses_chat_reply() {
    let server = MockServer::start().await;
    let content = serde_json::json!({
        "summary": "Introduces sparse attention.",
        "key_contributions": ["A sparse attention kernel"],
        "keywords": ["attention", "sparsity"]
    })
    .to_string();
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": {"role": "assistant", "content": content}
        })))
        .mount(&server)
        .await;

    let gateway = AnalysisGateway::new(
        ollama(&server),
        BreakerConfig::default(),
        AnalysisConfig::default(),
    );
    let fields = gateway.analyze(&request()).await.unwrap();
    assert_eq!(fields.summary, "Introduces sparse attention.");
    assert_eq!(fields.key_contributions.len(), 1);
    assert!(fields.keywords.contains("sparsity"));
}

#[tokio::test]
async fn test_analysis_gateway_http_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let gateway = AnalysisGateway::new(
        ollama(&server),
        BreakerConfig::default(),
        AnalysisConfig::default(),
    );
    let err = gateway.analyze(&request()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::Unavailable(_)));
    assert!(gateway.is_available());
}
