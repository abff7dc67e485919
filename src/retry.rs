//! Bounded retry with exponential backoff.
//!
//! One [`RetryPolicy`] is applied at every external call boundary
//! (embedding, vector search, model call, ingestion writes). Each attempt
//! runs under its own timeout; a timeout counts as a transient failure.
//! Only errors that report themselves retryable are tried again.

use std::future::Future;
use std::time::Duration;

use campus_copilot_core::error::{IndexError, UpstreamError};
use tracing::warn;

use crate::config::RetryConfig;

/// Errors the policy knows how to classify.
pub trait Retryable: Sized {
    fn is_retryable(&self) -> bool;
    /// The error recorded when an attempt exceeds its timeout.
    fn timed_out(service: &str, after: Duration) -> Self;
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        UpstreamError::is_retryable(self)
    }
    fn timed_out(service: &str, after: Duration) -> Self {
        UpstreamError::timeout(service, after)
    }
}

impl Retryable for IndexError {
    fn is_retryable(&self) -> bool {
        IndexError::is_retryable(self)
    }
    fn timed_out(service: &str, after: Duration) -> Self {
        IndexError::Upstream(UpstreamError::timeout(service, after))
    }
}

/// The last error and how many attempts were made.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub error: E,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based). The first attempt never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        service: &str,
        timeout: Duration,
        mut op: F,
    ) -> Result<T, Exhausted<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let delay = self.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let error = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => E::timed_out(service, timeout),
            };

            if !error.is_retryable() || attempt >= self.max_attempts {
                return Err(Exhausted {
                    attempts: attempt,
                    error,
                });
            }
            warn!(service, attempt, error = %error, "transient failure, retrying");
        }
    }
}
