//! Error types for upstream calls and the vector index.
//!
//! Every external collaborator (embedding endpoint, vector backend,
//! language model) reports failures as an [`UpstreamError`]. The
//! classification decides whether the retry policy may try again.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by an external service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// Rate limits, 5xx responses, dropped connections.
    #[error("{service} temporarily unavailable: {message}")]
    Transient { service: String, message: String },

    /// The call did not complete within its budget.
    #[error("{service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    /// Malformed responses, authentication failures, rejected input.
    #[error("{service} failed: {message}")]
    Fatal { service: String, message: String },
}

impl UpstreamError {
    pub fn transient(service: impl Into<String>, message: impl Into<String>) -> Self {
        UpstreamError::Transient {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn fatal(service: impl Into<String>, message: impl Into<String>) -> Self {
        UpstreamError::Fatal {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn timeout(service: impl Into<String>, after: Duration) -> Self {
        UpstreamError::Timeout {
            service: service.into(),
            after,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::Transient { .. } | UpstreamError::Timeout { .. }
        )
    }

    /// Classify an HTTP status: 429 and 5xx are transient, everything
    /// else is fatal.
    pub fn from_status(service: impl Into<String>, status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if status == 429 || (500..600).contains(&status) {
            UpstreamError::transient(service, message)
        } else {
            UpstreamError::fatal(service, message)
        }
    }
}

/// Errors raised by a [`VectorIndex`](crate::store::VectorIndex).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    /// A rebuild holds the write side; the writer should retry.
    #[error("index rebuild in progress, retry the write")]
    RebuildBusy,

    #[error("vector dimension mismatch: index uses {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Remote backends surface their transport failures here.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexError::RebuildBusy => true,
            IndexError::DimensionMismatch { .. } => false,
            IndexError::Upstream(e) => e.is_retryable(),
        }
    }
}
