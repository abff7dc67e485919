//! Answer orchestration.
//!
//! [`Orchestrator::answer`] runs one request on its own task and hands
//! back an [`AnswerStream`] of [`AnswerEvent`]s. The task walks a fixed
//! state machine:
//!
//! ```text
//! Received → CacheCheck ─────────────────────────────────────────┐
//!               │ miss                                            │ hit
//!               ▼                                                 ▼
//!           Retrieving → ContextBuilding → Generating → Streaming → Completed
//!
//! any non-terminal state ── unrecoverable failure ──▶ Error
//! ```
//!
//! - A cache hit replays the stored text, then its citations, then
//!   `done { cached: true }`. The model is not called.
//! - Zero evidence is not an error: the prompt switches to its degraded
//!   form and the answer ends with `done { degraded: true }`.
//! - Embedding, search and the model call up to its first token are
//!   retried by the shared policy. A failure after tokens have been sent
//!   is not retried: a truncation marker is sent and the stream ends with
//!   `done { truncated: true }`.
//! - The session and the cache are written only for complete answers.
//!   A failed, truncated or cancelled request leaves both untouched.
//! - Dropping the [`AnswerStream`] cancels the in-flight model call.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use campus_copilot_core::context::ContextAssembler;
use campus_copilot_core::error::UpstreamError;
use campus_copilot_core::models::{Citation, ContextBlock, Query, Role, Turn};
use campus_copilot_core::store::VectorIndex;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cache::{self, AnswerCache, CachedAnswer};
use crate::config::Config;
use crate::embedding::EmbeddingGateway;
use crate::error::{CopilotError, ErrorCode};
use crate::intent::{Intent, IntentRouter};
use crate::llm::{LanguageModel, TokenStream};
use crate::prompt::{build_prompt, Prompt};
use crate::retriever::{RetrievalContext, Retriever};
use crate::retry::RetryPolicy;
use crate::session::SessionStore;

const APOLOGY: &str = "Sorry, I couldn't answer that right now. Please try again in a moment.";
const TRUNCATION_MARKER: &str = "\n\n[answer truncated]";

// ============ Events ============

/// One item of an answer stream. `Done` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Token {
        text: String,
    },
    Citation(Citation),
    Done {
        cached: bool,
        degraded: bool,
        truncated: bool,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl AnswerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnswerEvent::Done { .. } | AnswerEvent::Error { .. })
    }
}

// ============ State machine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    CacheCheck,
    Retrieving,
    ContextBuilding,
    Generating,
    Streaming,
    Completed,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Received => "received",
            PipelineState::CacheCheck => "cache_check",
            PipelineState::Retrieving => "retrieving",
            PipelineState::ContextBuilding => "context_building",
            PipelineState::Generating => "generating",
            PipelineState::Streaming => "streaming",
            PipelineState::Completed => "completed",
            PipelineState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Error)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        if next == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Received, CacheCheck)
                | (CacheCheck, Completed)
                | (CacheCheck, Retrieving)
                | (Retrieving, ContextBuilding)
                | (ContextBuilding, Generating)
                | (Generating, Streaming)
                | (Streaming, Completed)
        )
    }
}

type StateTrace = Arc<Mutex<Vec<PipelineState>>>;

/// Current state of one request plus the record of every state visited.
struct Pipeline {
    state: PipelineState,
    trace: StateTrace,
}

impl Pipeline {
    fn new(trace: StateTrace) -> Self {
        trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PipelineState::Received);
        Self {
            state: PipelineState::Received,
            trace,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        if !self.state.can_transition_to(next) {
            error!(from = self.state.as_str(), to = next.as_str(), "invalid pipeline transition");
            debug_assert!(false, "invalid transition {:?} -> {:?}", self.state, next);
            return;
        }
        debug!(from = self.state.as_str(), state = next.as_str(), "pipeline transition");
        self.state = next;
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(next);
    }
}

// ============ Stream handle ============

/// Caller side of one answer. Dropping it cancels the request.
pub struct AnswerStream {
    rx: mpsc::Receiver<AnswerEvent>,
    trace: StateTrace,
    _cancel_on_drop: DropGuard,
}

impl AnswerStream {
    /// States the pipeline has passed through so far.
    pub fn states(&self) -> Vec<PipelineState> {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the stream into a single [`Answer`].
    pub async fn collect_answer(mut self) -> Answer {
        let mut answer = Answer::default();
        while let Some(event) = self.next().await {
            match event {
                AnswerEvent::Token { text } => answer.text.push_str(&text),
                AnswerEvent::Citation(c) => answer.citations.push(c),
                terminal => {
                    answer.terminal = Some(terminal);
                    break;
                }
            }
        }
        answer.states = self.states();
        answer
    }
}

impl Stream for AnswerStream {
    type Item = AnswerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A fully received answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub terminal: Option<AnswerEvent>,
    pub states: Vec<PipelineState>,
}

// ============ Orchestrator ============

/// External collaborators the orchestrator is wired with.
pub struct Collaborators {
    pub index: Arc<dyn VectorIndex>,
    pub gateway: EmbeddingGateway,
    pub model: Arc<dyn LanguageModel>,
    pub sessions: Arc<dyn SessionStore>,
    pub cache: Arc<dyn AnswerCache>,
}

#[derive(Debug, Clone)]
struct Settings {
    top_n: usize,
    token_budget: usize,
    system_prompt: String,
    history_turns: usize,
    continuity_turns: usize,
    fingerprint_turns: usize,
    max_query_chars: usize,
    llm_timeout: Duration,
    cache_ttl: Duration,
    stream_buffer: usize,
}

struct Inner {
    retriever: Retriever,
    assembler: ContextAssembler,
    router: IntentRouter,
    model: Arc<dyn LanguageModel>,
    sessions: Arc<dyn SessionStore>,
    cache: Arc<dyn AnswerCache>,
    policy: RetryPolicy,
    settings: Settings,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: &Config, parts: Collaborators) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        let retriever = Retriever::new(parts.gateway, parts.index, policy, &config.retrieval);
        let settings = Settings {
            top_n: config.retrieval.top_n,
            token_budget: config.context.token_budget,
            system_prompt: config.llm.system_prompt.clone(),
            history_turns: config.llm.history_turns,
            continuity_turns: config.retrieval.continuity_turns,
            fingerprint_turns: config.answer_window_turns(),
            max_query_chars: config.embedding.max_input_chars,
            llm_timeout: config.llm.timeout(),
            cache_ttl: config.cache.ttl(),
            stream_buffer: config.server.stream_buffer.max(1),
        };
        Self {
            inner: Arc::new(Inner {
                retriever,
                assembler: ContextAssembler::new(config.context.assembler_params()),
                router: IntentRouter::new(config.intents.clone()),
                model: parts.model,
                sessions: parts.sessions,
                cache: parts.cache,
                policy,
                settings,
            }),
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        self.inner.retriever.index()
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.inner.sessions
    }

    pub fn cache(&self) -> &Arc<dyn AnswerCache> {
        &self.inner.cache
    }

    pub fn resolve_intent(&self, query: &str) -> Intent {
        self.inner.router.resolve(query)
    }

    /// Reject questions that cannot be answered: blank, or longer than the
    /// embedding input limit.
    pub fn validate_query(&self, query: &str) -> Result<(), CopilotError> {
        self.inner.validate_query(query)
    }

    /// Start answering `query` for `session_id`. Must be called inside a
    /// Tokio runtime.
    pub fn answer(&self, session_id: impl Into<String>, query: impl Into<String>) -> AnswerStream {
        let query = Query::new(session_id, query);
        let (tx, rx) = mpsc::channel(self.inner.settings.stream_buffer);
        let cancel = CancellationToken::new();
        let trace: StateTrace = Arc::new(Mutex::new(Vec::new()));

        let span = info_span!("answer", session_id = %query.session_id);
        let inner = self.inner.clone();
        let task_cancel = cancel.clone();
        let task_trace = trace.clone();
        tokio::spawn(
            async move { inner.run(query, tx, task_cancel, task_trace).await }.instrument(span),
        );

        AnswerStream {
            rx,
            trace,
            _cancel_on_drop: cancel.drop_guard(),
        }
    }
}

/// Send one event; a closed channel means the caller went away.
async fn emit(tx: &mpsc::Sender<AnswerEvent>, event: AnswerEvent) -> Result<(), CopilotError> {
    tx.send(event).await.map_err(|_| CopilotError::Cancelled)
}

/// Race `fut` against cancellation.
async fn unless_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, CopilotError>>,
) -> Result<T, CopilotError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CopilotError::Cancelled),
        r = fut => r,
    }
}

impl Inner {
    fn validate_query(&self, query: &str) -> Result<(), CopilotError> {
        let text = query.trim();
        if text.is_empty() {
            return Err(CopilotError::InvalidInput("The question is empty.".into()));
        }
        let chars = text.chars().count();
        let limit = self.settings.max_query_chars;
        if chars > limit {
            return Err(CopilotError::InvalidInput(format!(
                "The question is {} characters long; the limit is {}.",
                chars, limit
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        query: Query,
        tx: mpsc::Sender<AnswerEvent>,
        cancel: CancellationToken,
        trace: StateTrace,
    ) {
        let started = Instant::now();
        let mut pipeline = Pipeline::new(trace);

        match self.execute(&query, &mut pipeline, &tx, &cancel).await {
            Ok(()) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "answer completed");
            }
            Err(CopilotError::Cancelled) => {
                if !pipeline.state.is_terminal() {
                    pipeline.advance(PipelineState::Error);
                }
                info!(
                    state = pipeline.state.as_str(),
                    "caller disconnected, answer abandoned"
                );
            }
            Err(e) => {
                pipeline.advance(PipelineState::Error);
                warn!(code = e.code().as_str(), error = %e, "answer failed");
                let _ = emit(&tx, AnswerEvent::Token { text: APOLOGY.to_string() }).await;
                let _ = emit(
                    &tx,
                    AnswerEvent::Error {
                        code: e.code(),
                        message: e.public_message(),
                    },
                )
                .await;
            }
        }
    }

    async fn execute(
        &self,
        query: &Query,
        pipeline: &mut Pipeline,
        tx: &mpsc::Sender<AnswerEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), CopilotError> {
        let settings = &self.settings;
        let session_id = query.session_id.as_str();
        let text = query.raw_text.trim();

        pipeline.advance(PipelineState::CacheCheck);
        self.validate_query(text)?;

        let session = self.sessions.get_or_create(session_id).await;
        let fingerprint = cache::fingerprint(&session, settings.fingerprint_turns);
        let key = cache::cache_key(
            self.retriever.index().version(),
            &cache::normalize_query(text),
            &fingerprint,
        );

        if let Some(hit) = self.cache.get(&key) {
            info!(cached = true, "cache hit");
            return self.replay(query, hit, pipeline, tx, cancel).await;
        }

        // Retrieval
        pipeline.advance(PipelineState::Retrieving);
        let intent = self.router.resolve(text);
        let ctx = RetrievalContext {
            filter: intent.filter.clone(),
            recently_cited: session
                .recent_references(settings.continuity_turns)
                .into_iter()
                .collect(),
        };
        let candidates =
            unless_cancelled(cancel, self.retriever.retrieve(text, &ctx, settings.top_n)).await?;
        info!(intent = %intent.name, candidates = candidates.len(), "retrieved");

        // Context
        pipeline.advance(PipelineState::ContextBuilding);
        let block = self.assembler.assemble(&candidates, settings.token_budget);
        debug!(
            entries = block.entries.len(),
            tokens = block.total_tokens,
            omitted = block.omitted,
            deduplicated = block.deduplicated,
            "context assembled"
        );

        // Generation
        pipeline.advance(PipelineState::Generating);
        let prompt = build_prompt(
            &settings.system_prompt,
            session.recent_turns(settings.history_turns),
            &block,
            text,
        );
        if prompt.degraded {
            info!("no evidence found, answering in degraded mode");
        }
        let (first, mut tokens) = unless_cancelled(cancel, self.start_generation(&prompt, cancel)).await?;

        // Streaming
        pipeline.advance(PipelineState::Streaming);
        let mut answer = first.clone();
        emit(tx, AnswerEvent::Token { text: first }).await?;

        let mut truncated = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CopilotError::Cancelled),
                n = tokio::time::timeout(settings.llm_timeout, tokens.next()) => n,
            };
            match next {
                Ok(Some(Ok(token))) => {
                    answer.push_str(&token);
                    emit(tx, AnswerEvent::Token { text: token }).await?;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "model stream failed mid-answer");
                    truncated = true;
                    break;
                }
                Err(_) => {
                    warn!(after = ?settings.llm_timeout, "model stream stalled mid-answer");
                    truncated = true;
                    break;
                }
            }
        }

        if truncated {
            emit(tx, AnswerEvent::Token { text: TRUNCATION_MARKER.to_string() }).await?;
            for citation in block.citations() {
                emit(tx, AnswerEvent::Citation(citation)).await?;
            }
            pipeline.advance(PipelineState::Completed);
            return emit(
                tx,
                AnswerEvent::Done {
                    cached: false,
                    degraded: prompt.degraded,
                    truncated: true,
                },
            )
            .await;
        }

        for citation in block.citations() {
            emit(tx, AnswerEvent::Citation(citation)).await?;
        }
        if cancel.is_cancelled() || tx.is_closed() {
            return Err(CopilotError::Cancelled);
        }

        pipeline.advance(PipelineState::Completed);
        self.record_exchange(query, &answer, &block).await;
        self.store(key, &answer, block.citations());
        emit(
            tx,
            AnswerEvent::Done {
                cached: false,
                degraded: prompt.degraded,
                truncated: false,
            },
        )
        .await
    }

    /// Call the model and wait for its first token, retrying the whole
    /// step on transient failure or timeout.
    async fn start_generation(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<(String, TokenStream), CopilotError> {
        let model = &self.model;
        self.policy
            .run("llm", self.settings.llm_timeout, || {
                let cancel = cancel.clone();
                async move {
                    let mut stream = model.generate(prompt, cancel).await?;
                    match stream.next().await {
                        Some(Ok(first)) => Ok((first, stream)),
                        Some(Err(e)) => Err(e),
                        None => Err(UpstreamError::transient("llm", "empty response stream")),
                    }
                }
            })
            .await
            .map_err(|e| CopilotError::GenerationFailed {
                attempts: e.attempts,
                source: e.error,
            })
    }

    async fn replay(
        &self,
        query: &Query,
        hit: CachedAnswer,
        pipeline: &mut Pipeline,
        tx: &mpsc::Sender<AnswerEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), CopilotError> {
        for chunk in hit.text.split_inclusive(' ') {
            emit(tx, AnswerEvent::Token { text: chunk.to_string() }).await?;
        }
        for citation in &hit.citations {
            emit(tx, AnswerEvent::Citation(citation.clone())).await?;
        }
        if cancel.is_cancelled() || tx.is_closed() {
            return Err(CopilotError::Cancelled);
        }

        pipeline.advance(PipelineState::Completed);
        let referenced = hit.citations.iter().map(|c| c.document_id.clone()).collect();
        self.append_exchange(query, &hit.text, referenced).await;
        emit(
            tx,
            AnswerEvent::Done {
                cached: true,
                degraded: hit.citations.is_empty(),
                truncated: false,
            },
        )
        .await
    }

    async fn record_exchange(&self, query: &Query, answer: &str, block: &ContextBlock) {
        self.append_exchange(query, answer, block.document_ids()).await;
    }

    async fn append_exchange(&self, query: &Query, answer: &str, referenced: Vec<String>) {
        let now = Utc::now();
        let turns = vec![
            Turn::new(Role::User, query.raw_text.trim(), query.timestamp),
            Turn::new(Role::Assistant, answer, now).with_references(referenced),
        ];
        let outcome = self.sessions.append_turns(&query.session_id, turns).await;
        debug!(
            running_tokens = outcome.running_tokens,
            dropped = outcome.dropped_turns,
            "session updated"
        );
    }

    /// Fire-and-forget cache write.
    fn store(&self, key: String, answer: &str, citations: Vec<Citation>) {
        let value = CachedAnswer {
            text: answer.to_string(),
            citations,
            created_at: Utc::now(),
            ttl: self.settings.cache_ttl,
        };
        if let Err(e) = self.cache.put(key, value, self.settings.cache_ttl) {
            warn!(error = %e, "cache write failed");
        }
    }
}
