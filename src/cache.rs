//! Answer cache.
//!
//! Keys are `v{index_version}:{sha256(normalized query ‖ session fingerprint)}`.
//! Bumping the index version therefore retires every older entry without a
//! sweep, and [`AnswerCache::invalidate_by_prefix`] reclaims them eagerly.
//!
//! The cache is an optimization only. Write failures are logged by the
//! caller and never reach the answer stream.

use std::time::Duration;

use campus_copilot_core::models::{Citation, Session};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::CacheConfig;

/// A complete answer as it was streamed.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CachedAnswer {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.created_at >= ttl,
            Err(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

pub trait AnswerCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedAnswer>;
    fn put(&self, key: String, value: CachedAnswer, ttl: Duration) -> Result<(), CacheError>;
    fn invalidate_by_prefix(&self, prefix: &str) -> Result<(), CacheError>;
    /// Live entries, expired ones possibly included until their next read.
    fn entry_count(&self) -> u64;
}

/// Bounded in-process cache on `moka`.
pub struct MokaAnswerCache {
    cache: Cache<String, CachedAnswer>,
}

impl MokaAnswerCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .support_invalidation_closures()
            .build();
        Self { cache }
    }
}

impl AnswerCache for MokaAnswerCache {
    fn get(&self, key: &str) -> Option<CachedAnswer> {
        let hit = self.cache.get(key)?;
        if hit.is_expired(Utc::now()) {
            self.cache.invalidate(key);
            return None;
        }
        Some(hit)
    }

    fn put(&self, key: String, mut value: CachedAnswer, ttl: Duration) -> Result<(), CacheError> {
        value.ttl = ttl;
        self.cache.insert(key, value);
        Ok(())
    }

    fn invalidate_by_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        let prefix = prefix.to_string();
        self.cache
            .invalidate_entries_if(move |k, _| k.starts_with(&prefix))
            .map(|_| ())
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

/// Used when `cache.enabled = false`.
pub struct NoopCache;

impl AnswerCache for NoopCache {
    fn get(&self, _key: &str) -> Option<CachedAnswer> {
        None
    }
    fn put(&self, _key: String, _value: CachedAnswer, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
    fn invalidate_by_prefix(&self, _prefix: &str) -> Result<(), CacheError> {
        Ok(())
    }
    fn entry_count(&self) -> u64 {
        0
    }
}

// ============ Keys ============

/// Lower-case, collapse whitespace, drop trailing punctuation.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

/// Hash of the last `turns` turns of a session, their cited document ids
/// included. `turns` must cover every turn the answer can depend on.
/// Empty history hashes the empty string, so every new session shares one
/// fingerprint.
pub fn fingerprint(session: &Session, turns: usize) -> String {
    let mut hasher = Sha256::new();
    for turn in session.recent_turns(turns) {
        hasher.update(turn.role.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(turn.text.as_bytes());
        for id in &turn.referenced_document_ids {
            hasher.update([0x1e]);
            hasher.update(id.as_bytes());
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

pub fn version_prefix(index_version: u64) -> String {
    format!("v{}:", index_version)
}

pub fn cache_key(index_version: u64, normalized_query: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    hasher.update([0x1f]);
    hasher.update(fingerprint.as_bytes());
    format!("{}{:x}", version_prefix(index_version), hasher.finalize())
}
