//! End-to-end tests of the answer pipeline with a scripted language model.
//!
//! Everything runs in-process: hash embeddings, the in-memory index, the
//! in-memory session store, and a moka cache wrapped to count writes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use campus_copilot::cache::{AnswerCache, CacheError, CachedAnswer, MokaAnswerCache};
use campus_copilot::config::Config;
use campus_copilot::embedding::EmbeddingGateway;
use campus_copilot::error::ErrorCode;
use campus_copilot::llm::{LanguageModel, TokenStream};
use campus_copilot::orchestrator::{AnswerEvent, Collaborators, Orchestrator, PipelineState};
use campus_copilot::prompt::Prompt;
use campus_copilot::retry::RetryPolicy;
use campus_copilot::session::{InMemorySessionStore, SessionStore};
use campus_copilot_core::embedding::HashEmbedder;
use campus_copilot_core::error::UpstreamError;
use campus_copilot_core::models::{Document, Role, Turn};
use campus_copilot_core::store::memory::InMemoryIndex;
use campus_copilot_core::store::VectorIndex;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

// ─── Scripted model ─────────────────────────────────────────────────

enum Reply {
    /// Accept the call but never produce a first token.
    Stall,
    /// Reject the call.
    Fail(UpstreamError),
    /// Stream these tokens, then fail.
    TokensThenFail(Vec<&'static str>, UpstreamError),
}

/// Replies from a script first; once it runs out, answers
/// `"Answer to: <question>"` word by word. Questions containing `slow`
/// wait before the first token.
struct ScriptedModel {
    script: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Prompt>>,
    token_delay: Duration,
    saw_cancel: Arc<AtomicBool>,
}

impl ScriptedModel {
    fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            token_delay: Duration::ZERO,
            saw_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_prompt(&self) -> Prompt {
        self.prompts.lock().unwrap().last().cloned().unwrap()
    }
}

fn question_of(prompt: &Prompt) -> String {
    let user = &prompt.messages.last().unwrap().content;
    user.rsplit("Question: ").next().unwrap_or("").to_string()
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        cancel: CancellationToken,
    ) -> Result<TokenStream, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.clone());

        let flag = self.saw_cancel.clone();
        let watch = cancel.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Reply::Stall) => Ok(stream::pending::<Result<String, UpstreamError>>().boxed()),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::TokensThenFail(tokens, e)) => {
                let items: Vec<Result<String, UpstreamError>> = tokens
                    .into_iter()
                    .map(|t| Ok(t.to_string()))
                    .chain(std::iter::once(Err(e)))
                    .collect();
                Ok(stream::iter(items).boxed())
            }
            None => {
                let question = question_of(prompt);
                let first_delay = if question.contains("slow") {
                    Duration::from_millis(300)
                } else {
                    Duration::ZERO
                };
                let text = format!("Answer to: {}", question);
                let tokens: Vec<String> = text.split_inclusive(' ').map(String::from).collect();
                let delay = self.token_delay;
                let s = stream::iter(tokens.into_iter().enumerate()).then(move |(i, t)| async move {
                    let wait = if i == 0 { first_delay + delay } else { delay };
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    Ok(t)
                });
                Ok(s.boxed())
            }
        }
    }
}

// ─── Recording cache ────────────────────────────────────────────────

struct RecordingCache {
    inner: MokaAnswerCache,
    puts: AtomicUsize,
}

impl AnswerCache for RecordingCache {
    fn get(&self, key: &str) -> Option<CachedAnswer> {
        self.inner.get(key)
    }

    fn put(&self, key: String, value: CachedAnswer, ttl: Duration) -> Result<(), CacheError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value, ttl)
    }

    fn invalidate_by_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        self.inner.invalidate_by_prefix(prefix)
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    orchestrator: Orchestrator,
    model: Arc<ScriptedModel>,
    cache: Arc<RecordingCache>,
    sessions: Arc<InMemorySessionStore>,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.llm.timeout_secs = 1;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config
}

async fn harness(config: Config, model: ScriptedModel, docs: &[(&str, &str, &str)]) -> Harness {
    let gateway = EmbeddingGateway::new(
        Arc::new(HashEmbedder::new(128)),
        RetryPolicy::from_config(&config.retry),
        &config.embedding,
    );
    let index = Arc::new(InMemoryIndex::new());
    for (uri, topic, text) in docs {
        let mut metadata = BTreeMap::new();
        metadata.insert("topic".to_string(), topic.to_string());
        index
            .insert(Document {
                id: format!("{}#0", uri),
                text: text.to_string(),
                source_uri: uri.to_string(),
                embedding: gateway.embed(text).await.unwrap(),
                metadata,
                updated_at: 0,
            })
            .await
            .unwrap();
    }

    let model = Arc::new(model);
    let cache = Arc::new(RecordingCache {
        inner: MokaAnswerCache::new(&config.cache),
        puts: AtomicUsize::new(0),
    });
    let sessions = Arc::new(InMemorySessionStore::new(&config.session));
    let orchestrator = Orchestrator::new(
        &config,
        Collaborators {
            index,
            gateway,
            model: model.clone(),
            sessions: sessions.clone(),
            cache: cache.clone(),
        },
    );
    Harness {
        orchestrator,
        model,
        cache,
        sessions,
    }
}

const CAMPUS: &[(&str, &str, &str)] = &[
    (
        "courses/cs101.md",
        "courses",
        "CS101 Introduction to Programming. Prerequisites for CS101: MATH100 or placement exam.",
    ),
    (
        "catalog/computer-science.md",
        "courses",
        "The computer science catalog lists CS101 prerequisites as algebra readiness.",
    ),
    (
        "advising/faq.md",
        "advising",
        "Advising FAQ: students ask about CS101 prerequisites and waitlists every term.",
    ),
    (
        "dining/hours.md",
        "dining",
        "The dining hall menu changes daily. Breakfast is served from 7am.",
    ),
];

fn done(cached: bool, degraded: bool, truncated: bool) -> Option<AnswerEvent> {
    Some(AnswerEvent::Done {
        cached,
        degraded,
        truncated,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_answer_streams_tokens_citations_then_done() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), CAMPUS).await;
    let q = "What are the prerequisites for CS101?";
    let answer = h.orchestrator.answer("s1", q).collect_answer().await;

    assert_eq!(answer.text, format!("Answer to: {}", q));
    assert!(!answer.citations.is_empty());
    assert_eq!(answer.terminal, done(false, false, false));
    assert_eq!(
        answer.states,
        vec![
            PipelineState::Received,
            PipelineState::CacheCheck,
            PipelineState::Retrieving,
            PipelineState::ContextBuilding,
            PipelineState::Generating,
            PipelineState::Streaming,
            PipelineState::Completed,
        ]
    );

    let session = h.sessions.get("s1").await.unwrap();
    assert_eq!(session.turns.len(), 2);
    assert_eq!(session.turns[0].role, Role::User);
    assert_eq!(session.turns[1].text, answer.text);
    assert!(!session.turns[1].referenced_document_ids.is_empty());
    assert_eq!(h.cache.puts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cs101_top_two_distinct_sources() {
    let mut config = test_config();
    config.retrieval.top_n = 2;
    config.context.token_budget = 500;
    let h = harness(config, ScriptedModel::new(vec![]), &CAMPUS[..3]).await;

    let answer = h
        .orchestrator
        .answer("s1", "What are the prerequisites for CS101?")
        .collect_answer()
        .await;

    assert_eq!(answer.citations.len(), 2);
    assert_eq!(answer.citations[0].marker, 1);
    assert_eq!(answer.citations[1].marker, 2);
    assert_ne!(answer.citations[0].source_uri, answer.citations[1].source_uri);

    let user = h.model.last_prompt().messages.last().unwrap().content.clone();
    assert!(user.contains("[1] ("));
    assert!(user.contains("[2] ("));
    assert!(!user.contains("[3] ("));
}

#[tokio::test]
async fn test_zero_evidence_is_degraded_not_error() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), &[]).await;
    let answer = h
        .orchestrator
        .answer("s1", "Where is the observatory?")
        .collect_answer()
        .await;

    assert_eq!(answer.terminal, done(false, true, false));
    assert!(answer.citations.is_empty());
    assert!(answer.states.contains(&PipelineState::Generating));
    assert!(!answer.states.contains(&PipelineState::Error));
    assert!(h.model.last_prompt().degraded);
}

#[tokio::test]
async fn test_intent_filter_limits_evidence() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), CAMPUS).await;
    let answer = h
        .orchestrator
        .answer("s1", "What is on the dining menu?")
        .collect_answer()
        .await;

    assert!(!answer.citations.is_empty());
    assert!(answer
        .citations
        .iter()
        .all(|c| c.source_uri.starts_with("dining/")));
}

#[tokio::test]
async fn test_cache_hit_is_byte_identical_without_model_call() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), CAMPUS).await;
    let q = "What are the prerequisites for CS101?";

    let first = h.orchestrator.answer("alice", q).collect_answer().await;
    assert_eq!(h.model.calls(), 1);

    // Fresh session: same (empty) history fingerprint, so the key matches.
    let second = h
        .orchestrator
        .answer("bob", "  what are the prerequisites for cs101 ")
        .collect_answer()
        .await;

    assert_eq!(h.model.calls(), 1);
    assert_eq!(second.text, first.text);
    assert_eq!(second.citations, first.citations);
    assert_eq!(second.terminal, done(true, false, false));
    assert_eq!(
        second.states,
        vec![
            PipelineState::Received,
            PipelineState::CacheCheck,
            PipelineState::Completed,
        ]
    );
    // The hit still joins bob's history.
    assert_eq!(h.sessions.get("bob").await.unwrap().turns.len(), 2);
}

#[tokio::test]
async fn test_history_changes_cache_key() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), CAMPUS).await;
    let q = "What are the prerequisites for CS101?";
    h.orchestrator.answer("s1", q).collect_answer().await;
    let again = h.orchestrator.answer("s1", q).collect_answer().await;

    assert_eq!(h.model.calls(), 2);
    assert_eq!(again.terminal, done(false, false, false));
    // The follow-up prompt replays the first exchange.
    let prompt = h.model.last_prompt();
    assert_eq!(prompt.messages.len(), 4);
    assert_eq!(prompt.messages[1].role, "user");
    assert_eq!(prompt.messages[2].role, "assistant");
}

#[tokio::test]
async fn test_older_history_in_prompt_window_changes_cache_key() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), CAMPUS).await;
    let seed = |first: &'static str| {
        let now = Utc::now();
        let mut turns = vec![
            Turn::new(Role::User, first, now),
            Turn::new(Role::Assistant, "Thanks, noted.", now),
        ];
        for _ in 0..2 {
            turns.push(Turn::new(Role::User, "When are fees due?", now));
            turns.push(Turn::new(Role::Assistant, "Fees are due in August.", now));
        }
        turns
    };
    h.sessions.append_turns("grad", seed("I am a graduate student")).await;
    h.sessions.append_turns("undergrad", seed("I am an undergraduate")).await;

    let q = "Which tuition rate applies to me?";
    h.orchestrator.answer("grad", q).collect_answer().await;
    let second = h.orchestrator.answer("undergrad", q).collect_answer().await;

    assert_eq!(h.model.calls(), 2);
    assert!(matches!(
        second.terminal,
        Some(AnswerEvent::Done { cached: false, .. })
    ));
    let prompt = h.model.last_prompt();
    assert!(prompt
        .messages
        .iter()
        .any(|m| m.content == "I am an undergraduate"));
    assert!(!prompt
        .messages
        .iter()
        .any(|m| m.content.contains("graduate student")));
}

#[tokio::test]
async fn test_timeout_twice_then_success() {
    let model = ScriptedModel::new(vec![Reply::Stall, Reply::Stall]);
    let h = harness(test_config(), model, CAMPUS).await;
    let q = "What are the prerequisites for CS101?";
    let answer = h.orchestrator.answer("s1", q).collect_answer().await;

    assert_eq!(h.model.calls(), 3);
    assert_eq!(answer.text, format!("Answer to: {}", q));
    assert_eq!(answer.terminal, done(false, false, false));
    assert!(!answer.states.contains(&PipelineState::Error));
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    let flaky = || Reply::Fail(UpstreamError::transient("llm", "HTTP 503"));
    let model = ScriptedModel::new(vec![flaky(), flaky(), flaky()]);
    let h = harness(test_config(), model, CAMPUS).await;
    let answer = h
        .orchestrator
        .answer("s1", "What are the prerequisites for CS101?")
        .collect_answer()
        .await;

    assert_eq!(h.model.calls(), 3);
    match answer.terminal {
        Some(AnswerEvent::Error { code, message }) => {
            assert_eq!(code, ErrorCode::TransientUpstream);
            assert!(!message.contains("503"));
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert!(answer.text.starts_with("Sorry"));
    assert_eq!(answer.states.last(), Some(&PipelineState::Error));
    assert!(h.sessions.get("s1").await.unwrap().turns.is_empty());
    assert_eq!(h.cache.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let model = ScriptedModel::new(vec![Reply::Fail(UpstreamError::fatal(
        "llm",
        "HTTP 401: invalid api key",
    ))]);
    let h = harness(test_config(), model, CAMPUS).await;
    let answer = h
        .orchestrator
        .answer("s1", "What are the prerequisites for CS101?")
        .collect_answer()
        .await;

    assert_eq!(h.model.calls(), 1);
    assert!(answer.text.starts_with("Sorry"));
    assert!(answer.citations.is_empty());
    assert!(matches!(
        answer.terminal,
        Some(AnswerEvent::Error {
            code: ErrorCode::FatalUpstream,
            ..
        })
    ));
}

#[tokio::test]
async fn test_mid_stream_failure_truncates_without_writes() {
    let model = ScriptedModel::new(vec![Reply::TokensThenFail(
        vec!["CS101 ", "requires "],
        UpstreamError::transient("llm", "connection reset"),
    )]);
    let h = harness(test_config(), model, CAMPUS).await;
    let answer = h
        .orchestrator
        .answer("s1", "What are the prerequisites for CS101?")
        .collect_answer()
        .await;

    assert_eq!(h.model.calls(), 1);
    assert!(answer.text.starts_with("CS101 requires "));
    assert!(answer.text.ends_with("[answer truncated]"));
    assert!(!answer.citations.is_empty());
    assert_eq!(answer.terminal, done(false, false, true));
    assert!(h.sessions.get("s1").await.unwrap().turns.is_empty());
    assert_eq!(h.cache.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_disconnect_mid_stream_persists_nothing() {
    let model = ScriptedModel::new(vec![]).with_token_delay(Duration::from_millis(20));
    let h = harness(test_config(), model, CAMPUS).await;
    let q = "What are the prerequisites for CS101 this spring term please?";
    let total = format!("Answer to: {}", q).split_inclusive(' ').count();

    let mut stream = h.orchestrator.answer("s1", q);
    let mut received = 0;
    while let Some(event) = stream.next().await {
        if let AnswerEvent::Token { .. } = event {
            received += 1;
            if received * 10 >= total * 4 {
                break;
            }
        }
    }
    assert!(received < total);
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.model.saw_cancel.load(Ordering::SeqCst));
    assert!(h.sessions.get("s1").await.unwrap().turns.is_empty());
    assert_eq!(h.cache.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_blank_query_is_invalid_input() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), CAMPUS).await;
    let answer = h.orchestrator.answer("s1", "   ").collect_answer().await;

    assert_eq!(h.model.calls(), 0);
    assert!(matches!(
        answer.terminal,
        Some(AnswerEvent::Error {
            code: ErrorCode::InvalidInput,
            ..
        })
    ));
}

#[tokio::test]
async fn test_oversize_query_is_rejected_before_retrieval() {
    let config = test_config();
    let long = "tuition ".repeat(config.embedding.max_input_chars / 8 + 1);
    let h = harness(config, ScriptedModel::new(vec![]), CAMPUS).await;

    assert!(h.orchestrator.validate_query(&long).is_err());
    assert!(h.orchestrator.validate_query("When is breakfast?").is_ok());

    let answer = h.orchestrator.answer("s1", long).collect_answer().await;
    assert_eq!(h.model.calls(), 0);
    assert!(!answer.states.contains(&PipelineState::Retrieving));
    assert!(matches!(
        answer.terminal,
        Some(AnswerEvent::Error {
            code: ErrorCode::InvalidInput,
            ..
        })
    ));
}

#[tokio::test]
async fn test_session_history_follows_completion_order() {
    let h = harness(test_config(), ScriptedModel::new(vec![]), CAMPUS).await;
    let slow = h.orchestrator.answer("shared", "slow question about CS101");
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = h.orchestrator.answer("shared", "fast question about dining");

    let (slow, fast) = tokio::join!(slow.collect_answer(), fast.collect_answer());
    assert_eq!(slow.terminal, done(false, false, false));
    assert_eq!(fast.terminal, done(false, false, false));

    let session = h.sessions.get("shared").await.unwrap();
    let texts: Vec<&str> = session.turns.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "fast question about dining",
            fast.text.as_str(),
            "slow question about CS101",
            slow.text.as_str(),
        ]
    );
}

#[tokio::test]
async fn test_session_window_drops_oldest_turns() {
    let mut config = test_config();
    config.session.max_tokens = 40;
    let h = harness(config, ScriptedModel::new(vec![]), CAMPUS).await;

    for i in 0..6 {
        let q = format!("question number {} about the CS101 course", i);
        h.orchestrator.answer("s1", q).collect_answer().await;
    }

    let session = h.sessions.get("s1").await.unwrap();
    assert!(session.truncated);
    assert!(session.running_tokens <= 40);
    let newest = session.turns.back().unwrap();
    assert_eq!(newest.role, Role::Assistant);
    assert!(newest.text.contains("question number 5"));
}
