//! # Campus Copilot Core
//!
//! Runtime-free logic for Campus Copilot: data models, token estimation,
//! chunking, calendar parsing, the vector index abstraction, re-ranking,
//! context assembly, and session budgeting.
//!
//! This crate contains no tokio, HTTP clients, or filesystem I/O. Every
//! function here is either pure or operates through the [`store::VectorIndex`]
//! trait, so the ranking and budgeting rules can be tested in isolation
//! from the network-facing `campus-copilot` crate.

pub mod calendar;
pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod models;
pub mod rerank;
pub mod store;
pub mod tokens;
