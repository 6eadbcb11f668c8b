//! Error types for FlowCore
//!
//! This module defines the error taxonomy for the session continuity core.
//! Uses `thiserror` for ergonomic error handling with automatic `Display`
//! and `Error` trait implementations.
//!
//! Two conditions from the flow-control design are deliberately *not*
//! errors:
//!
//! - Transport degradation (streaming unavailable, single-shot used) is
//!   handled inside the transport manager and never surfaces to callers.
//! - "Fork not needed" is informational and is modeled as a variant of
//!   [`ForkOutcome`](crate::fork::ForkOutcome).

use thiserror::Error;

/// The primary error type for FlowCore operations.
///
/// Every failure is scoped to one request or one session; nothing in this
/// taxonomy is fatal to the process.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Request denied by the sliding-window rate limiter. The caller must
    /// wait `retry_after_secs` before the oldest in-window request expires.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// The provider did not respond within the profile's dispatch deadline.
    /// The caller may retry with a different provider; this core does not.
    #[error("Provider '{provider}' timed out after {timeout_secs}s")]
    ProviderTimeout { provider: String, timeout_secs: f64 },

    /// The upstream provider rejected the request. Surfaced verbatim,
    /// never retried here.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The client-facing channel failed mid-stream. Partial output, if
    /// non-empty, has been preserved as an incomplete message.
    #[error("Channel dropped: {0}")]
    ChannelDropped(String),

    /// The delegated summarization call failed. The fork was aborted and
    /// the original session is intact.
    #[error("Summarization failed: {0}")]
    SummarizationFailed(String),

    /// Another fork is currently executing for this source session.
    #[error("Fork already in progress for session '{0}'")]
    ForkInProgress(String),

    /// No session exists with the given id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session state errors (appending to a forked session, etc.)
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration errors (unknown provider, missing agent default, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Returns `true` if the caller could reasonably retry this request
    /// (against another provider, or after waiting).
    ///
    /// This core performs no retries itself; the classification exists for
    /// the embedding application's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::RateLimitExceeded { .. }
                | FlowError::ProviderTimeout { .. }
                | FlowError::ChannelDropped(_)
        )
    }

    /// Returns `true` if this error leaves the session in its pre-request
    /// state (no messages appended, no usage recorded).
    pub fn is_session_neutral(&self) -> bool {
        matches!(
            self,
            FlowError::RateLimitExceeded { .. }
                | FlowError::SummarizationFailed(_)
                | FlowError::ForkInProgress(_)
                | FlowError::SessionNotFound(_)
                | FlowError::Config(_)
        )
    }
}

/// Convenient result type alias using [`FlowError`].
pub type Result<T> = std::result::Result<T, FlowError>;
