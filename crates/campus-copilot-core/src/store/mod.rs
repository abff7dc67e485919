//! Vector index abstraction for Campus Copilot.
//!
//! The [`VectorIndex`] trait defines the storage operations needed by the
//! retrieval pipeline, enabling pluggable backends (in-memory today, a
//! remote vector database behind the same interface).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::models::{Candidate, Document};

/// Metadata equality predicates. A document matches when every key is
/// present in its metadata with exactly the given value. The empty filter
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter(pub BTreeMap<String, String>);

impl MetadataFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.into(), value.into());
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| metadata.get(k).map(|m| m == v).unwrap_or(false))
    }
}

/// Result of compacting an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub live: usize,
    pub removed: usize,
}

/// Abstract vector storage backend.
///
/// All operations are async (via `async-trait`) so remote backends fit the
/// same seam. In-memory implementations return immediately-ready futures.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert`](VectorIndex::insert) | Insert or replace one document |
/// | [`upsert`](VectorIndex::upsert) | Bulk insert or replace |
/// | [`delete`](VectorIndex::delete) | Remove a document by id |
/// | [`get`](VectorIndex::get) | Fetch a document by id |
/// | [`search`](VectorIndex::search) | Filtered nearest-neighbour search |
/// | [`rebuild`](VectorIndex::rebuild) | Compact deleted slots |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert a document, replacing any previous document with the same id.
    ///
    /// Fails with [`IndexError::RebuildBusy`] while a rebuild holds the
    /// write side.
    async fn insert(&self, doc: Document) -> Result<(), IndexError>;

    /// Insert many documents. Returns the number written.
    async fn upsert(&self, docs: Vec<Document>) -> Result<usize, IndexError> {
        let mut written = 0;
        for doc in docs {
            self.insert(doc).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Remove a document. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, IndexError>;

    async fn get(&self, id: &str) -> Result<Option<Document>, IndexError>;

    /// Return at most `k` documents matching `filter`, ordered by
    /// descending cosine similarity with ties broken by ascending id.
    ///
    /// The filter is applied before the limit, so a fully filtered index
    /// returns an empty vector rather than an error.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Candidate>, IndexError>;

    /// Number of live documents.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic content version, bumped by every insert and delete.
    fn version(&self) -> u64;

    /// Share of storage slots occupied by deleted or replaced documents.
    fn deletion_ratio(&self) -> f64;

    /// Compact storage. Readers keep working; writers get
    /// [`IndexError::RebuildBusy`] until it finishes.
    async fn rebuild(&self) -> Result<RebuildStats, IndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(MetadataFilter::none().matches(&BTreeMap::new()));
    }

    #[test]
    fn test_filter_requires_every_key() {
        let mut meta = BTreeMap::new();
        meta.insert("topic".to_string(), "dining".to_string());
        assert!(MetadataFilter::eq("topic", "dining").matches(&meta));
        assert!(!MetadataFilter::eq("topic", "events").matches(&meta));
        assert!(!MetadataFilter::eq("campus", "main").matches(&meta));
    }
}
