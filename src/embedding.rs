//! Embedding providers and the retrying gateway in front of them.
//!
//! Providers implement [`Embedder`] and make exactly one attempt per call,
//! classifying failures as transient (HTTP 429, 5xx, connection errors)
//! or fatal (other 4xx, malformed bodies). The [`EmbeddingGateway`]
//! validates input, bounds each attempt with `embedding.timeout_secs`,
//! and applies the shared [`RetryPolicy`].
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `disabled` | always fails; retrieval is unavailable |
//! | `hash` | offline feature hashing, see [`HashEmbedder`] |
//! | `openai` | `POST {url}/v1/embeddings` |
//! | `ollama` | `POST {url}/api/embed` |

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use campus_copilot_core::embedding::{Embedder, HashEmbedder};
use campus_copilot_core::error::UpstreamError;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::CopilotError;
use crate::retry::RetryPolicy;

const SERVICE: &str = "embedding";

/// Instantiate the provider selected by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims.unwrap_or(256)))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Gateway ============

/// Validating, retrying front for an [`Embedder`].
#[derive(Clone)]
pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    policy: RetryPolicy,
    timeout: std::time::Duration,
    max_input_chars: usize,
}

impl EmbeddingGateway {
    pub fn new(embedder: Arc<dyn Embedder>, policy: RetryPolicy, config: &EmbeddingConfig) -> Self {
        Self {
            embedder,
            policy,
            timeout: config.timeout(),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Embed one text.
    ///
    /// Empty or oversize input is rejected up front; chunking is the
    /// caller's job. A vector of the wrong length is a fatal upstream error.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, CopilotError> {
        if text.trim().is_empty() {
            return Err(CopilotError::InvalidInput("text to embed is empty".into()));
        }
        let chars = text.chars().count();
        if chars > self.max_input_chars {
            return Err(CopilotError::InvalidInput(format!(
                "text to embed is {} chars, limit is {}",
                chars, self.max_input_chars
            )));
        }

        let expected = self.embedder.dims();
        let embedder = &self.embedder;
        let vector = self
            .policy
            .run(SERVICE, self.timeout, || async move {
                let v = embedder.embed(text).await?;
                if v.len() != expected {
                    return Err(UpstreamError::fatal(
                        SERVICE,
                        format!("expected {} dims, got {}", expected, v.len()),
                    ));
                }
                Ok(v)
            })
            .await
            .map_err(|e| CopilotError::EmbeddingUnavailable {
                attempts: e.attempts,
                source: e.error,
            })?;

        debug!(model = embedder.model_name(), chars, "embedded text");
        Ok(vector)
    }
}

// ============ Disabled ============

/// Placeholder used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, UpstreamError> {
        Err(UpstreamError::fatal(SERVICE, "embedding provider is disabled"))
    }
}

// ============ OpenAI ============

/// OpenAI-compatible `/v1/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            client: reqwest::Client::builder().timeout(config.timeout()).build()?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let json = read_json(response).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[0].embedding` from an OpenAI embeddings response.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, UpstreamError> {
    json.get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .map(|values| to_f32(values))
        .ok_or_else(|| UpstreamError::fatal(SERVICE, "invalid OpenAI response: missing data[0].embedding"))
}

// ============ Ollama ============

/// Local Ollama instance, `POST /api/embed`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: reqwest::Client::builder().timeout(config.timeout()).build()?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                UpstreamError::transient(
                    SERVICE,
                    format!("Ollama connection error (is Ollama running at {}?): {}", self.url, e),
                )
            })?;
        let json = read_json(response).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, UpstreamError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .and_then(|e| e.as_array())
        .map(|values| to_f32(values))
        .ok_or_else(|| UpstreamError::fatal(SERVICE, "invalid Ollama response: missing embeddings[0]"))
}

// ============ Shared HTTP helpers ============

fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        UpstreamError::transient(SERVICE, e.to_string())
    } else {
        UpstreamError::fatal(SERVICE, e.to_string())
    }
}

async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, UpstreamError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::from_status(SERVICE, status.as_u16(), &body));
    }
    response
        .json()
        .await
        .map_err(|e| UpstreamError::fatal(SERVICE, format!("malformed response body: {}", e)))
}

fn to_f32(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}
