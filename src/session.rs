//! Conversation session store.
//!
//! Sessions are keyed by id in a `DashMap`; each value sits behind its own
//! async mutex so writes to one session are serialized while different
//! sessions never contend. The orchestrator appends a whole exchange
//! (user turn + assistant turn) under one lock acquisition, which is what
//! makes history follow completion order.
//!
//! [`SessionStore::evict_idle`] is the only way a session is destroyed. A
//! session whose lock is held by a writer is skipped by the sweep.

use std::sync::Arc;

use async_trait::async_trait;
use campus_copilot_core::models::{AppendOutcome, Session, Turn};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::SessionConfig;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Snapshot of the session, creating an empty one if needed.
    async fn get_or_create(&self, session_id: &str) -> Session;

    /// Snapshot of an existing session.
    async fn get(&self, session_id: &str) -> Option<Session>;

    async fn append_turn(&self, session_id: &str, turn: Turn) -> AppendOutcome {
        self.append_turns(session_id, vec![turn]).await
    }

    /// Append several turns atomically with respect to other writers of
    /// the same session.
    async fn append_turns(&self, session_id: &str, turns: Vec<Turn>) -> AppendOutcome;

    /// Drop sessions idle for longer than the configured timeout.
    /// Returns how many were removed.
    async fn evict_idle(&self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Slot = Arc<Mutex<Session>>;

pub struct InMemorySessionStore {
    sessions: DashMap<String, Slot>,
    max_tokens: usize,
    idle_timeout: chrono::Duration,
}

impl InMemorySessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            max_tokens: config.max_tokens,
            idle_timeout: chrono::Duration::from_std(config.idle_timeout())
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
        }
    }

    /// Clone the slot out of the map so no shard lock is held across an await.
    fn slot(&self, session_id: &str) -> Slot {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(session_id, Utc::now()))))
            .clone()
    }

    fn is_current(&self, session_id: &str, slot: &Slot) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| Arc::ptr_eq(s.value(), slot))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, session_id: &str) -> Session {
        let slot = self.slot(session_id);
        let session = slot.lock().await;
        session.clone()
    }

    async fn get(&self, session_id: &str) -> Option<Session> {
        let slot = self.sessions.get(session_id).map(|s| s.value().clone())?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    async fn append_turns(&self, session_id: &str, turns: Vec<Turn>) -> AppendOutcome {
        let mut session = loop {
            let slot = self.slot(session_id);
            let guard = slot.clone().lock_owned().await;
            // The sweep may have removed this slot between lookup and lock.
            if self.is_current(session_id, &slot) {
                break guard;
            }
        };

        let mut outcome = AppendOutcome::default();
        for turn in turns {
            let step = session.append(turn, self.max_tokens);
            outcome.dropped_turns += step.dropped_turns;
            outcome.running_tokens = step.running_tokens;
        }
        if outcome.dropped_turns > 0 {
            debug!(
                session_id,
                dropped = outcome.dropped_turns,
                running_tokens = outcome.running_tokens,
                "session window truncated"
            );
        }
        outcome
    }

    async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        let timeout = self.idle_timeout;
        self.sessions.retain(|_, slot| match slot.try_lock() {
            Ok(session) => session.idle_duration(now) <= timeout,
            Err(_) => true,
        });
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            info!(evicted, remaining = self.sessions.len(), "evicted idle sessions");
        }
        evicted
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}
