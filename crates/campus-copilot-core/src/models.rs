//! Core data models shared by the retrieval and conversation pipeline.
//!
//! Documents live in the vector index, candidates flow from the retriever
//! to the context assembler, and sessions hold the per-caller turn history.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tokens::estimate_tokens;

/// An indexed passage with its embedding.
///
/// Documents are immutable once inserted; re-inserting the same `id`
/// replaces the previous version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    /// Where the passage came from (relative path or URL). Used for
    /// citations and for deduplicating overlapping excerpts.
    pub source_uri: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Unix timestamp of the last modification of the source.
    #[serde(default)]
    pub updated_at: i64,
}

/// A single inbound question.
#[derive(Debug, Clone)]
pub struct Query {
    pub raw_text: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Query {
    pub fn new(session_id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A document ranked as potentially relevant to a query.
///
/// Carries the passage text and source so that re-ranking and context
/// assembly need no further index lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub document_id: String,
    pub source_uri: String,
    /// Similarity from the index, replaced by the blended score after
    /// re-ranking.
    pub relevance_score: f64,
    /// 1-based position after re-ranking; `0` before ranks are assigned.
    pub rank: usize,
    pub text: String,
    /// Lower-cased query terms that occur in `text`.
    pub matched_terms: Vec<String>,
    pub updated_at: i64,
}

/// One cited excerpt inside a [`ContextBlock`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    /// Citation marker, `1..=n` in inclusion order.
    pub marker: usize,
    pub document_id: String,
    pub source_uri: String,
    pub excerpt: String,
    pub tokens: usize,
}

/// Budget-constrained evidence handed to the language model.
///
/// Invariant: `total_tokens <= budget`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBlock {
    pub entries: Vec<ContextEntry>,
    pub total_tokens: usize,
    pub budget: usize,
    /// Candidates left out because the next excerpt would overflow the budget.
    pub omitted: usize,
    /// Candidates skipped as near-duplicates of a higher-ranked excerpt.
    pub deduplicated: usize,
}

impl ContextBlock {
    pub fn empty(budget: usize) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Citations in marker order.
    pub fn citations(&self) -> Vec<Citation> {
        self.entries
            .iter()
            .map(|e| Citation {
                marker: e.marker,
                document_id: e.document_id.clone(),
                source_uri: e.source_uri.clone(),
            })
            .collect()
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.document_id.clone()).collect()
    }
}

/// A citation emitted alongside an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub marker: usize,
    pub document_id: String,
    pub source_uri: String,
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub referenced_document_ids: Vec<String>,
    pub tokens: usize,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let text = text.into();
        let tokens = estimate_tokens(&text);
        Self {
            role,
            text,
            timestamp,
            referenced_document_ids: Vec::new(),
            tokens,
        }
    }

    pub fn with_references(mut self, ids: Vec<String>) -> Self {
        self.referenced_document_ids = ids;
        self
    }
}

/// Per-caller conversation state.
///
/// Turns are chronological and only ever removed from the front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub turns: VecDeque<Turn>,
    pub running_tokens: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Set once any turn has been dropped to respect the token budget.
    pub truncated: bool,
}

/// What happened during a [`Session::append`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub dropped_turns: usize,
    pub running_tokens: usize,
}

impl Session {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            turns: VecDeque::new(),
            running_tokens: 0,
            created_at: now,
            last_activity: now,
            truncated: false,
        }
    }

    /// Append a turn, then drop the oldest turns until the window fits
    /// `max_tokens` again.
    ///
    /// The turn just appended is never dropped, even if it alone exceeds
    /// the budget. A timestamp older than the previous turn is clamped to
    /// keep the history chronological.
    pub fn append(&mut self, mut turn: Turn, max_tokens: usize) -> AppendOutcome {
        if let Some(last) = self.turns.back() {
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }
        if turn.timestamp > self.last_activity {
            self.last_activity = turn.timestamp;
        }

        self.running_tokens += turn.tokens;
        self.turns.push_back(turn);

        let mut dropped = 0;
        while self.running_tokens > max_tokens && self.turns.len() > 1 {
            if let Some(old) = self.turns.pop_front() {
                self.running_tokens -= old.tokens;
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.truncated = true;
        }

        AppendOutcome {
            dropped_turns: dropped,
            running_tokens: self.running_tokens,
        }
    }

    /// The last `n` turns, oldest first.
    pub fn recent_turns(&self, n: usize) -> impl Iterator<Item = &Turn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip)
    }

    /// Document ids cited by the last `n` turns.
    pub fn recent_references(&self, n: usize) -> Vec<String> {
        let mut ids: Vec<String> = self
            .recent_turns(n)
            .flat_map(|t| t.referenced_document_ids.iter().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn idle_duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }
}
