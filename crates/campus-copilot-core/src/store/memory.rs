//! In-memory [`VectorIndex`] implementation.
//!
//! Documents are kept in append-only slots behind a `std::sync::RwLock`.
//! Replacing or deleting a document leaves a tombstone; [`rebuild`] compacts
//! the slots once tombstones pile up. Search is brute-force cosine
//! similarity over all live slots.
//!
//! [`rebuild`]: VectorIndex::rebuild

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::IndexError;
use crate::models::{Candidate, Document};

use super::{MetadataFilter, RebuildStats, VectorIndex};

#[derive(Default)]
struct Slots {
    slots: Vec<Option<Arc<Document>>>,
    by_id: HashMap<String, usize>,
    tombstones: usize,
    dims: Option<usize>,
}

/// In-memory vector index.
pub struct InMemoryIndex {
    inner: RwLock<Slots>,
    rebuilding: AtomicBool,
    version: AtomicU64,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots::default()),
            rebuilding: AtomicBool::new(false),
            version: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the write side for a mutation. The rebuild flag is checked
    /// under the lock so a write can never slip between a rebuild's
    /// snapshot and its swap.
    fn write_for_mutation(&self) -> Result<RwLockWriteGuard<'_, Slots>, IndexError> {
        let guard = self.write();
        if self.rebuilding.load(Ordering::SeqCst) {
            return Err(IndexError::RebuildBusy);
        }
        Ok(guard)
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn insert(&self, doc: Document) -> Result<(), IndexError> {
        let mut inner = self.write_for_mutation()?;

        let dims = inner.dims;
        match dims {
            Some(expected) if expected != doc.embedding.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: doc.embedding.len(),
                });
            }
            None => inner.dims = Some(doc.embedding.len()),
            _ => {}
        }

        let pos = inner.slots.len();
        let id = doc.id.clone();
        inner.slots.push(Some(Arc::new(doc)));
        if let Some(old) = inner.by_id.insert(id, pos) {
            inner.slots[old] = None;
            inner.tombstones += 1;
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, IndexError> {
        let mut inner = self.write_for_mutation()?;
        match inner.by_id.remove(id) {
            Some(pos) => {
                inner.slots[pos] = None;
                inner.tombstones += 1;
                self.version.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, IndexError> {
        let inner = self.read();
        Ok(inner
            .by_id
            .get(id)
            .and_then(|&pos| inner.slots[pos].as_ref())
            .map(|d| d.as_ref().clone()))
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<Candidate>, IndexError> {
        let inner = self.read();
        if let Some(expected) = inner.dims {
            if expected != query.len() {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f64, &Arc<Document>)> = inner
            .slots
            .iter()
            .flatten()
            .filter(|d| filter.matches(&d.metadata))
            .map(|d| (cosine_similarity(query, &d.embedding) as f64, d))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, d))| Candidate {
                document_id: d.id.clone(),
                source_uri: d.source_uri.clone(),
                relevance_score: score,
                rank: i + 1,
                text: d.text.clone(),
                matched_terms: Vec::new(),
                updated_at: d.updated_at,
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.read().by_id.len()
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn deletion_ratio(&self) -> f64 {
        let inner = self.read();
        if inner.slots.is_empty() {
            0.0
        } else {
            inner.tombstones as f64 / inner.slots.len() as f64
        }
    }

    async fn rebuild(&self) -> Result<RebuildStats, IndexError> {
        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IndexError::RebuildBusy);
        }

        // Build the compacted copy while readers continue.
        let (slots, by_id, removed) = {
            let inner = self.read();
            let live: Vec<Option<Arc<Document>>> =
                inner.slots.iter().flatten().cloned().map(Some).collect();
            let by_id: HashMap<String, usize> = live
                .iter()
                .enumerate()
                .filter_map(|(i, d)| d.as_ref().map(|d| (d.id.clone(), i)))
                .collect();
            (live, by_id, inner.tombstones)
        };

        let live = slots.len();
        {
            let mut inner = self.write();
            inner.slots = slots;
            inner.by_id = by_id;
            inner.tombstones = 0;
        }
        self.rebuilding.store(false, Ordering::SeqCst);

        Ok(RebuildStats { live, removed })
    }
}
