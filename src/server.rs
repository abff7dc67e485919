//! HTTP front end.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness plus index, session and cache counts |
//! | `POST` | `/chat` | Answer a question as a stream of NDJSON events |
//!
//! `/chat` takes `{ "query": "...", "session_id": "..." }`. The session id
//! is optional; a fresh one is generated when it is missing. The response
//! body is one [`AnswerEvent`] per line and ends with a `done` or `error`
//! event. Response headers carry the session id (`x-session-id`) and the
//! routed intent (`x-intent`).
//!
//! Closing the connection mid-answer cancels the request.
//!
//! # Error Contract
//!
//! Request validation errors are returned before streaming starts:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "The question is empty." } }
//! ```
//!
//! Failures after streaming starts arrive as an `error` event instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::convert::Infallible;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::orchestrator::{AnswerEvent, Orchestrator};

pub const SESSION_HEADER: &str = "x-session-id";
pub const INTENT_HEADER: &str = "x-intent";
const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Build the router. Split from [`run_server`] so tests can drive it
/// without binding a socket.
pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::HeaderName::from_static(SESSION_HEADER),
            header::HeaderName::from_static(INTENT_HEADER),
        ]);

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

/// Serve until `shutdown` fires.
pub async fn run_server(
    config: &Config,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(orchestrator);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "copilot server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("copilot server stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    /// Unix seconds.
    ts: i64,
    version: String,
    documents: usize,
    index_version: u64,
    sessions: usize,
    cache_entries: u64,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let o = &state.orchestrator;
    Json(HealthResponse {
        ok: true,
        ts: Utc::now().timestamp(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        documents: o.index().len(),
        index_version: o.index().version(),
        sessions: o.sessions().len(),
        cache_entries: o.cache().entry_count(),
    })
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    query: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let query = req.query.trim().to_string();
    state
        .orchestrator
        .validate_query(&query)
        .map_err(|e| bad_request(e.public_message()))?;
    let session_id = match req.session_id.map(|s| s.trim().to_string()) {
        Some(id) if !id.is_empty() => id,
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let session_header = HeaderValue::from_str(&session_id)
        .map_err(|_| bad_request("session_id contains invalid characters"))?;

    let intent = state.orchestrator.resolve_intent(&query);
    info!(session_id = %session_id, intent = %intent.name, "chat request");
    let intent_header =
        HeaderValue::from_str(&intent.name).unwrap_or_else(|_| HeaderValue::from_static("general"));

    // Dropping the body stream (client gone) drops the AnswerStream, which
    // cancels the request.
    let events = state.orchestrator.answer(session_id, query);
    let lines = events.map(|event| Ok::<_, Infallible>(encode_line(&event)));

    let mut response = Response::new(Body::from_stream(lines));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(SESSION_HEADER, session_header);
    headers.insert(INTENT_HEADER, intent_header);
    Ok(response)
}

fn encode_line(event: &AnswerEvent) -> String {
    match serde_json::to_string(event) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(e) => {
            warn!(error = %e, "failed to encode answer event");
            "{\"type\":\"error\",\"code\":\"fatal_upstream\",\"message\":\"encoding failed\"}\n"
                .to_string()
        }
    }
}
