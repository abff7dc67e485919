//! Pipeline errors surfaced by the answer orchestrator.
//!
//! Every failure from an external collaborator is mapped into a
//! [`CopilotError`] at the orchestrator boundary. Callers never see a raw
//! transport error: the terminal stream event carries only an
//! [`ErrorCode`] and a short message.

use campus_copilot_core::error::{IndexError, UpstreamError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CopilotError {
    #[error("embedding unavailable after {attempts} attempt(s): {source}")]
    EmbeddingUnavailable {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },

    /// Rejected before any external call (blank query, oversize text).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("retrieval failed after {attempts} attempt(s): {source}")]
    Retrieval {
        attempts: u32,
        #[source]
        source: IndexError,
    },

    #[error("generation failed after {attempts} attempt(s): {source}")]
    GenerationFailed {
        attempts: u32,
        #[source]
        source: UpstreamError,
    },

    #[error("cancelled by caller")]
    Cancelled,
}

/// Distinguishable code carried by the terminal `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    TransientUpstream,
    FatalUpstream,
    InvalidInput,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TransientUpstream => "transient_upstream",
            ErrorCode::FatalUpstream => "fatal_upstream",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::Cancelled => "cancelled",
        }
    }
}

impl CopilotError {
    pub fn code(&self) -> ErrorCode {
        let upstream = |retryable: bool| {
            if retryable {
                ErrorCode::TransientUpstream
            } else {
                ErrorCode::FatalUpstream
            }
        };
        match self {
            CopilotError::EmbeddingUnavailable { source, .. } => upstream(source.is_retryable()),
            CopilotError::Retrieval { source, .. } => upstream(source.is_retryable()),
            CopilotError::GenerationFailed { source, .. } => upstream(source.is_retryable()),
            CopilotError::InvalidInput(_) => ErrorCode::InvalidInput,
            CopilotError::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Short caller-facing description. Upstream details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            CopilotError::EmbeddingUnavailable { .. } | CopilotError::Retrieval { .. } => {
                "The knowledge base is temporarily unavailable.".to_string()
            }
            CopilotError::GenerationFailed { .. } => {
                "The answer service is temporarily unavailable.".to_string()
            }
            CopilotError::InvalidInput(reason) => reason.clone(),
            CopilotError::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}
