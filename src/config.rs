//! TOML configuration.
//!
//! Every numeric threshold in the pipeline (budgets, ttls, retry counts,
//! timeouts) is read from here; nothing is hard-coded at call sites.
//! All sections are optional and fall back to the defaults below.
//!
//! ```toml
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [context]
//! token_budget = 1500
//!
//! [[intents]]
//! name = "dining"
//! keywords = ["dining", "menu"]
//! filter = { topic = "dining" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use campus_copilot_core::context::AssemblerParams;
use campus_copilot_core::rerank::RerankParams;
use campus_copilot_core::store::MetadataFilter;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_intents")]
    pub intents: Vec<IntentRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            retrieval: RetrievalConfig::default(),
            context: ContextConfig::default(),
            session: SessionConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            maintenance: MaintenanceConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig::default(),
            intents: default_intents(),
        }
    }
}

impl Config {
    /// Turns of session state an answer can depend on: the history
    /// replayed into the prompt and the citations used for re-ranking.
    /// The cache fingerprint covers exactly this window.
    pub fn answer_window_turns(&self) -> usize {
        self.llm.history_turns.max(self.retrieval.continuity_turns)
    }
}

// ============ Embedding ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `hash`, `openai`, or `ollama`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (e.g. `http://localhost:11434` for Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    /// Longest text accepted by the gateway; longer input must be chunked.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            timeout_secs: default_embedding_timeout_secs(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    8000
}

// ============ Language model ============

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `openai` (any OpenAI-compatible chat endpoint).
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    /// Budget for the first token, and for each gap between tokens.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Number of prior turns replayed into the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            api_key_env: default_openai_key_env(),
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            system_prompt: default_system_prompt(),
            history_turns: default_history_turns(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    800
}
fn default_system_prompt() -> String {
    "You are Campus Copilot, an assistant for students. Answer using the numbered \
     sources provided and cite them inline as [n]. If the sources do not contain \
     the answer, say so plainly."
        .to_string()
}
fn default_history_turns() -> usize {
    6
}

// ============ Retry ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Total attempts per external call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    4000
}

// ============ Retrieval ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// The index is searched for `top_n × overfetch_factor` candidates.
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_continuity_boost")]
    pub continuity_boost: f64,
    /// Turns whose citations count as "recently cited" for re-ranking.
    #[serde(default = "default_continuity_turns")]
    pub continuity_turns: usize,
    /// Candidates at or below this raw similarity are not evidence.
    #[serde(default)]
    pub min_similarity: f64,
    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            overfetch_factor: default_overfetch_factor(),
            lexical_weight: default_lexical_weight(),
            continuity_boost: default_continuity_boost(),
            continuity_turns: default_continuity_turns(),
            min_similarity: 0.0,
            timeout_ms: default_search_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn rerank_params(&self) -> RerankParams {
        RerankParams {
            lexical_weight: self.lexical_weight,
            continuity_boost: self.continuity_boost,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_top_n() -> usize {
    5
}
fn default_overfetch_factor() -> usize {
    3
}
fn default_lexical_weight() -> f64 {
    0.05
}
fn default_continuity_boost() -> f64 {
    0.01
}
fn default_continuity_turns() -> usize {
    4
}
fn default_search_timeout_ms() -> u64 {
    2000
}

// ============ Context ============

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_excerpt_margin_chars")]
    pub excerpt_margin_chars: usize,
    #[serde(default = "default_max_excerpt_chars")]
    pub max_excerpt_chars: usize,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            excerpt_margin_chars: default_excerpt_margin_chars(),
            max_excerpt_chars: default_max_excerpt_chars(),
            dedup_threshold: default_dedup_threshold(),
        }
    }
}

impl ContextConfig {
    pub fn assembler_params(&self) -> AssemblerParams {
        AssemblerParams {
            excerpt_margin_chars: self.excerpt_margin_chars,
            max_excerpt_chars: self.max_excerpt_chars,
            dedup_threshold: self.dedup_threshold,
        }
    }
}

fn default_token_budget() -> usize {
    1500
}
fn default_excerpt_margin_chars() -> usize {
    200
}
fn default_max_excerpt_chars() -> usize {
    1200
}
fn default_dedup_threshold() -> f64 {
    0.8
}

// ============ Session ============

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Sliding-window budget over the stored turns.
    #[serde(default = "default_session_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_session_max_tokens(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn default_session_max_tokens() -> usize {
    4000
}
fn default_idle_timeout_secs() -> u64 {
    1800
}

// ============ Cache ============

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_cache_max_entries() -> u64 {
    10_000
}

// ============ Index & maintenance ============

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Deletion ratio above which the background job compacts the index.
    #[serde(default = "default_rebuild_threshold")]
    pub rebuild_threshold: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rebuild_threshold: default_rebuild_threshold(),
        }
    }
}

fn default_rebuild_threshold() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

// ============ Ingest ============

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Directory of `.md` / `.txt` sources loaded by `serve` and `ask`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// iCalendar feed of campus events: an `http(s)` URL or a local path.
    #[serde(default)]
    pub events_url: Option<String>,
    /// Upcoming events kept from the feed.
    #[serde(default = "default_events_limit")]
    pub events_limit: usize,
    #[serde(default = "default_events_timeout_secs")]
    pub events_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: None,
            chunk_max_tokens: default_chunk_max_tokens(),
            extensions: default_extensions(),
            events_url: None,
            events_limit: default_events_limit(),
            events_timeout_secs: default_events_timeout_secs(),
        }
    }
}

impl IngestConfig {
    pub fn events_timeout(&self) -> Duration {
        Duration::from_secs(self.events_timeout_secs)
    }
}

fn default_chunk_max_tokens() -> usize {
    300
}
fn default_extensions() -> Vec<String> {
    vec!["md".to_string(), "txt".to_string()]
}
fn default_events_limit() -> usize {
    10
}
fn default_events_timeout_secs() -> u64 {
    30
}

// ============ Server ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Capacity of the per-request event channel.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_stream_buffer() -> usize {
    64
}

// ============ Intents ============

/// Keyword rule mapping a question to a retrieval filter.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IntentRule {
    pub name: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub filter: MetadataFilter,
}

fn default_intents() -> Vec<IntentRule> {
    let rule = |name: &str, keywords: &[&str]| IntentRule {
        name: name.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        filter: MetadataFilter::eq("topic", name),
    };
    vec![
        rule("events", &["event", "happening"]),
        rule("dining", &["dining", "menu"]),
        rule("cost", &["tuition", "average cost", "cost"]),
    ]
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        let dims = config.embedding.dims;
        if dims == Some(0) || (dims.is_none() && config.embedding.provider != "hash") {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.provider != "hash" && config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.max_input_chars == 0 {
        bail!("embedding.max_input_chars must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                bail!("llm.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.timeout_secs == 0 || config.embedding.timeout_secs == 0 {
        bail!("timeouts must be > 0");
    }

    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
        bail!("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
    }

    if config.retrieval.top_n == 0 {
        bail!("retrieval.top_n must be >= 1");
    }
    if config.retrieval.overfetch_factor == 0 {
        bail!("retrieval.overfetch_factor must be >= 1");
    }
    if config.context.token_budget == 0 {
        bail!("context.token_budget must be > 0");
    }
    if !(0.0..=1.0).contains(&config.context.dedup_threshold) {
        bail!("context.dedup_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.index.rebuild_threshold) {
        bail!("index.rebuild_threshold must be in [0.0, 1.0]");
    }
    if config.session.max_tokens == 0 {
        bail!("session.max_tokens must be > 0");
    }
    if config.ingest.chunk_max_tokens == 0 {
        bail!("ingest.chunk_max_tokens must be > 0");
    }
    if config.ingest.chunk_max_tokens * campus_copilot_core::tokens::CHARS_PER_TOKEN
        > config.embedding.max_input_chars
    {
        bail!("ingest.chunk_max_tokens produces passages longer than embedding.max_input_chars");
    }
    if config.ingest.events_limit == 0 || config.ingest.events_timeout_secs == 0 {
        bail!("ingest.events_limit and ingest.events_timeout_secs must be > 0");
    }
    if config.maintenance.sweep_interval_secs == 0 {
        bail!("maintenance.sweep_interval_secs must be > 0");
    }
    for rule in &config.intents {
        if rule.keywords.is_empty() {
            bail!("intent '{}' has no keywords", rule.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.retrieval.top_n, 5);
        assert_eq!(config.retrieval.overfetch_factor, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.intents.len(), 3);
        assert_eq!(config.intents[1].filter, MetadataFilter::eq("topic", "dining"));
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
[embedding]
provider = "hash"
dims = 128

[llm]
provider = "openai"
model = "gpt-4o-mini"
url = "http://localhost:11434/v1"
timeout_secs = 5

[context]
token_budget = 500

[cache]
ttl_secs = 30

[[intents]]
name = "parking"
keywords = ["parking", "permit"]
filter = { topic = "parking" }
"#,
        )
        .unwrap();
        assert_eq!(config.embedding.dims, Some(128));
        assert_eq!(config.llm.timeout(), Duration::from_secs(5));
        assert_eq!(config.context.token_budget, 500);
        assert_eq!(config.cache.ttl(), Duration::from_secs(30));
        assert_eq!(config.intents.len(), 1);
        assert_eq!(config.intents[0].filter, MetadataFilter::eq("topic", "parking"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse_config("[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_rejects_enabled_embedding_without_dims() {
        assert!(parse_config("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n").is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/copilot.example.toml")).unwrap();
        assert_eq!(config.embedding.dims, Some(1536));
        assert_eq!(config.intents.len(), 3);
        assert_eq!(config.ingest.root, Some(PathBuf::from("./campus-docs")));
        assert_eq!(config.ingest.events_limit, 10);
        assert!(config.ingest.events_url.is_some());
    }

    #[test]
    fn test_answer_window_covers_prompt_and_continuity() {
        let mut config = Config::default();
        assert_eq!(config.answer_window_turns(), 6);
        config.retrieval.continuity_turns = 10;
        assert_eq!(config.answer_window_turns(), 10);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        assert!(parse_config("[retry]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retrieval]\ntop_n = 2").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.retrieval.top_n, 2);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config(Path::new("/nonexistent/copilot.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
