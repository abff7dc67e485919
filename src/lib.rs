//! # Campus Copilot
//!
//! Retrieval-augmented, multi-turn question answering over a campus
//! document corpus.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │  Ingest  │──▶│ Embedding │──▶│ Vector Index │
//! │ md / txt │   │  Gateway  │   │  (in-memory) │
//! └──────────┘   └───────────┘   └──────┬───────┘
//!                                       │
//!   query ──▶ Cache ──miss──▶ Retriever ┘──▶ Context ──▶ LLM ──▶ events
//!               │                           Assembler
//!               └──hit──────────────────────────────────────────▶ events
//! ```
//!
//! The [`orchestrator::Orchestrator`] owns the request state machine and
//! streams [`orchestrator::AnswerEvent`]s. Sessions and the answer cache
//! are written only when an answer completes.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Request-level errors and their public codes |
//! | [`retry`] | Bounded retry with exponential backoff and per-attempt timeouts |
//! | [`embedding`] | Embedding providers and the validating gateway |
//! | [`llm`] | Streaming language model providers |
//! | [`prompt`] | Prompt construction with source markers |
//! | [`retriever`] | Embed, search, filter and re-rank |
//! | [`session`] | Conversation session store |
//! | [`cache`] | Answer cache and key derivation |
//! | [`intent`] | Keyword intent routing to metadata filters |
//! | [`orchestrator`] | Request state machine and answer streams |
//! | [`ingest`] | Directory ingestion |
//! | [`maintenance`] | Idle-session eviction and index compaction |
//! | [`server`] | HTTP API |
//!
//! Pure ranking, chunking and budgeting logic lives in the
//! `campus-copilot-core` crate.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod intent;
pub mod llm;
pub mod maintenance;
pub mod orchestrator;
pub mod prompt;
pub mod retriever;
pub mod retry;
pub mod server;
pub mod session;
