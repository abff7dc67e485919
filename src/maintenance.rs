//! Background maintenance: idle session eviction and index compaction.
//!
//! One sweep per `maintenance.sweep_interval_secs`. Stops when the
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use campus_copilot_core::error::IndexError;
use campus_copilot_core::store::VectorIndex;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_sessions: usize,
    pub rebuilt: bool,
}

pub struct Maintenance {
    sessions: Arc<dyn SessionStore>,
    index: Arc<dyn VectorIndex>,
    rebuild_threshold: f64,
    sweep_interval: Duration,
}

impl Maintenance {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        index: Arc<dyn VectorIndex>,
        rebuild_threshold: f64,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            sessions,
            index,
            rebuild_threshold,
            sweep_interval,
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let evicted_sessions = self.sessions.evict_idle(Utc::now()).await;

        let ratio = self.index.deletion_ratio();
        let mut rebuilt = false;
        if ratio > self.rebuild_threshold {
            match self.index.rebuild().await {
                Ok(stats) => {
                    info!(
                        live = stats.live,
                        removed = stats.removed,
                        ratio,
                        "index rebuilt"
                    );
                    rebuilt = true;
                }
                Err(IndexError::RebuildBusy) => debug!("rebuild already running, skipped"),
                Err(e) => warn!(error = %e, "index rebuild failed"),
            }
        }

        SweepReport {
            evicted_sessions,
            rebuilt,
        }
    }

    /// Run sweeps until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(
                interval_secs = self.sweep_interval.as_secs(),
                "maintenance started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
            info!("maintenance stopped");
        })
    }
}
