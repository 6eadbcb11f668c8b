//! Client-facing stream frame protocol
//!
//! A response is delivered as an in-order sequence of typed frames:
//! zero or more `chunk` frames followed by exactly one terminal frame
//! (`complete` or `error`). Single-shot mode delivers only the terminal
//! frame. The same logical response (full text, usage, provider/model)
//! reaches the caller either way.

use crate::budget::ContextHeadroom;
use crate::session::TokenUsage;
use serde::{Deserialize, Serialize};

/// One frame of the client-facing stream protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// An incremental fragment of model output, forwarded in arrival order.
    Chunk { content: String },
    /// Terminal frame for a successful turn.
    Complete {
        /// The full response text
        full_content: String,
        /// Usage for this turn (reported or estimated)
        usage: TokenUsage,
        /// Provider that served the request
        provider: String,
        /// Model that served the request
        model: String,
        /// Post-turn context headroom, so callers can surface a fork
        /// recommendation without a second round-trip
        headroom: ContextHeadroom,
    },
    /// Terminal frame for a failed turn.
    Error { message: String },
}

impl Frame {
    /// Whether this frame ends the stream. No frame may follow a
    /// terminal frame.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Frame::Chunk { .. })
    }
}
