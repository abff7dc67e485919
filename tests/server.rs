//! HTTP surface tests, driven through the router without binding a port.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use campus_copilot::cache::MokaAnswerCache;
use campus_copilot::config::Config;
use campus_copilot::embedding::EmbeddingGateway;
use campus_copilot::llm::{LanguageModel, TokenStream};
use campus_copilot::orchestrator::{AnswerEvent, Collaborators, Orchestrator};
use campus_copilot::prompt::Prompt;
use campus_copilot::retry::RetryPolicy;
use campus_copilot::server::{router, INTENT_HEADER, SESSION_HEADER};
use campus_copilot::session::{InMemorySessionStore, SessionStore};
use campus_copilot_core::embedding::HashEmbedder;
use campus_copilot_core::error::UpstreamError;
use campus_copilot_core::models::Document;
use campus_copilot_core::store::memory::InMemoryIndex;
use campus_copilot_core::store::VectorIndex;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct FixedModel;

#[async_trait]
impl LanguageModel for FixedModel {
    fn model_name(&self) -> &str {
        "fixed"
    }

    async fn generate(
        &self,
        _prompt: &Prompt,
        _cancel: CancellationToken,
    ) -> Result<TokenStream, UpstreamError> {
        let tokens = vec![Ok("Breakfast ".to_string()), Ok("starts at 7am.".to_string())];
        Ok(stream::iter(tokens).boxed())
    }
}

async fn app() -> (axum::Router, Arc<InMemorySessionStore>) {
    let config = Config::default();
    let gateway = EmbeddingGateway::new(
        Arc::new(HashEmbedder::new(64)),
        RetryPolicy::default(),
        &config.embedding,
    );
    let index = Arc::new(InMemoryIndex::new());
    let text = "The dining hall menu changes daily. Breakfast starts at 7am.";
    let mut metadata = BTreeMap::new();
    metadata.insert("topic".to_string(), "dining".to_string());
    index
        .insert(Document {
            id: "dining/hours.md#0".into(),
            text: text.into(),
            source_uri: "dining/hours.md".into(),
            embedding: gateway.embed(text).await.unwrap(),
            metadata,
            updated_at: 0,
        })
        .await
        .unwrap();

    let sessions = Arc::new(InMemorySessionStore::new(&config.session));
    let orchestrator = Orchestrator::new(
        &config,
        Collaborators {
            index,
            gateway,
            model: Arc::new(FixedModel),
            sessions: sessions.clone(),
            cache: Arc::new(MokaAnswerCache::new(&config.cache)),
        },
    );
    (router(orchestrator), sessions)
}

fn chat(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app().await;
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["ok"], true);
    assert!(json["ts"].as_i64().unwrap() > 0);
    assert_eq!(json["documents"], 1);
    assert_eq!(json["cache_entries"], 0);
}

#[tokio::test]
async fn test_chat_streams_ndjson_events() {
    let (app, sessions) = app().await;
    let resp = app
        .oneshot(chat(
            r#"{"session_id": "web-1", "query": "When does the dining hall open?"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[SESSION_HEADER], "web-1");
    assert_eq!(resp.headers()[INTENT_HEADER], "dining");
    assert_eq!(resp.headers()["content-type"], "application/x-ndjson");

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let events: Vec<AnswerEvent> = String::from_utf8(body.to_vec())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(
        events[0],
        AnswerEvent::Token {
            text: "Breakfast ".into()
        }
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, AnswerEvent::Citation(c) if c.source_uri == "dining/hours.md")));
    assert_eq!(
        events.last(),
        Some(&AnswerEvent::Done {
            cached: false,
            degraded: false,
            truncated: false
        })
    );
    assert_eq!(sessions.get("web-1").await.unwrap().turns.len(), 2);
}

#[tokio::test]
async fn test_chat_generates_session_id() {
    let (app, _) = app().await;
    let resp = app
        .oneshot(chat(r#"{"query": "What events are happening?"}"#))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let id = resp.headers()[SESSION_HEADER].to_str().unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
    assert_eq!(resp.headers()[INTENT_HEADER], "events");
}

#[tokio::test]
async fn test_chat_rejects_blank_query() {
    let (app, _) = app().await;
    let resp = app.oneshot(chat(r#"{"query": "   "}"#)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_chat_rejects_query_over_embedding_limit() {
    let (app, sessions) = app().await;
    let limit = Config::default().embedding.max_input_chars;
    let body = serde_json::json!({ "session_id": "web-2", "query": "a".repeat(limit + 1) });
    let resp = app.oneshot(chat(&body.to_string())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "bad_request");
    assert!(json["error"]["message"].as_str().unwrap().contains("limit"));
    assert!(sessions.get("web-2").await.is_none());
}
