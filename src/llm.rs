//! Language-model abstraction and the streaming chat-completions client.
//!
//! [`LanguageModel::generate`] returns once the call has been accepted and
//! yields the answer as a lazy [`TokenStream`]. The cancellation token is
//! the hook the orchestrator uses when the caller goes away: a cancelled
//! stream simply ends.

use anyhow::{bail, Result};
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestAssistantMessage, ChatCompletionRequestAssistantMessageContent,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use campus_copilot_core::error::UpstreamError;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::LlmConfig;
use crate::prompt::Prompt;

const SERVICE: &str = "llm";

/// Streamed answer fragments.
pub type TokenStream = BoxStream<'static, Result<String, UpstreamError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &Prompt,
        cancel: CancellationToken,
    ) -> Result<TokenStream, UpstreamError>;
}

pub fn create_model(config: &LlmConfig) -> Result<std::sync::Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledModel)),
        "openai" => Ok(std::sync::Arc::new(OpenAiChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

// ============ Disabled ============

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(
        &self,
        _prompt: &Prompt,
        _cancel: CancellationToken,
    ) -> Result<TokenStream, UpstreamError> {
        Err(UpstreamError::fatal(SERVICE, "language model is disabled"))
    }
}

// ============ OpenAI-compatible chat completions ============

/// Any endpoint speaking the OpenAI chat-completions protocol with
/// streaming (OpenAI, Ollama's `/v1`, vLLM, llama.cpp server).
pub struct OpenAiChatModel {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for OpenAI provider"))?;
        // Local servers usually run without a key.
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() && config.url.is_none() {
            bail!("{} environment variable not set", config.api_key_env);
        }

        let mut openai_config = OpenAIConfig::new();
        if let Some(url) = &config.url {
            openai_config = openai_config.with_api_base(url.trim_end_matches('/'));
        }
        if let Some(key) = api_key {
            openai_config = openai_config.with_api_key(key);
        }
        debug!(model = %model, url = ?config.url, "chat client created");

        Ok(Self {
            client: Client::with_config(openai_config),
            model,
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
        })
    }

    #[allow(deprecated)]
    fn request(&self, prompt: &Prompt) -> Result<CreateChatCompletionRequest, UpstreamError> {
        CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .messages(request_messages(prompt))
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(upstream_error)
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        cancel: CancellationToken,
    ) -> Result<TokenStream, UpstreamError> {
        let request = self.request(prompt)?;
        let chat = self.client.chat();
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(stream::empty::<Result<String, UpstreamError>>().boxed());
            }
            r = chat.create_stream(request) => r.map_err(upstream_error)?,
        };

        let tokens = stream
            .take_until(cancel.cancelled_owned())
            .filter_map(|item| async move {
                match item {
                    Ok(chunk) => {
                        let text: String = chunk
                            .choices
                            .iter()
                            .filter_map(|choice| choice.delta.content.as_deref())
                            .collect();
                        (!text.is_empty()).then_some(Ok(text))
                    }
                    Err(e) => Some(Err(upstream_error(e))),
                }
            })
            .boxed();
        Ok(tokens)
    }
}

/// Map the prompt transcript onto request messages. Unknown roles are
/// sent as user messages.
fn request_messages(prompt: &Prompt) -> Vec<ChatCompletionRequestMessage> {
    prompt
        .messages
        .iter()
        .map(|m| match m.role.as_str() {
            "system" => ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: ChatCompletionRequestSystemMessageContent::Text(m.content.clone()),
                name: None,
            }),
            "assistant" => {
                #[allow(deprecated)]
                let message = ChatCompletionRequestAssistantMessage {
                    content: Some(ChatCompletionRequestAssistantMessageContent::Text(
                        m.content.clone(),
                    )),
                    name: None,
                    refusal: None,
                    audio: None,
                    tool_calls: None,
                    function_call: None,
                };
                ChatCompletionRequestMessage::Assistant(message)
            }
            _ => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(m.content.clone()),
                name: None,
            }),
        })
        .collect()
}

/// Transport and stream failures are transient; so are API errors that
/// report rate limiting or server trouble. Everything else is fatal.
fn upstream_error(e: OpenAIError) -> UpstreamError {
    let retryable = match &e {
        OpenAIError::Reqwest(_) | OpenAIError::StreamError(_) => true,
        OpenAIError::ApiError(api) => is_retryable_kind(api.r#type.as_deref()),
        _ => false,
    };
    if retryable {
        UpstreamError::transient(SERVICE, e.to_string())
    } else {
        UpstreamError::fatal(SERVICE, e.to_string())
    }
}

fn is_retryable_kind(kind: Option<&str>) -> bool {
    matches!(
        kind,
        Some("rate_limit_exceeded" | "requests" | "tokens" | "server_error" | "overloaded_error")
    )
}
