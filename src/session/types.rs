//! Session types for FlowCore
//!
//! This module defines the core types for conversation state: sessions,
//! messages, roles, token usage, and session lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single logical conversation: an ordered message history plus
/// aggregate token usage and a lifecycle state.
///
/// The message sequence is append-only and totally ordered; no two
/// messages in the same session share a position. Sessions are never
/// deleted by this core (deletion is an external collaborator's concern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque unique identifier
    pub id: String,
    /// Ordered list of messages in this conversation
    pub messages: Vec<Message>,
    /// Aggregate token usage, monotonically non-decreasing
    pub usage: TokenUsage,
    /// Lifecycle state
    pub state: SessionState,
    /// Id of the session this one was forked from, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<String>,
    /// When this session was created
    pub created_at: DateTime<Utc>,
    /// When this session was last modified
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new empty session with a generated id.
    pub fn new() -> Self {
        Self::with_id(&Uuid::new_v4().to_string())
    }

    /// Create a new empty session with the given id.
    ///
    /// # Example
    /// ```
    /// use flowcore::session::Session;
    ///
    /// let session = Session::with_id("chat-123");
    /// assert!(session.messages.is_empty());
    /// ```
    pub fn with_id(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            usage: TokenUsage::default(),
            state: SessionState::Active,
            forked_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message, assigning it the next position in the sequence.
    ///
    /// Returns the position the message was appended at. Messages are
    /// immutable once appended.
    ///
    /// # Example
    /// ```
    /// use flowcore::session::{Session, Message};
    ///
    /// let mut session = Session::with_id("test");
    /// let pos = session.append(Message::user("Hello!"));
    /// assert_eq!(pos, 0);
    /// assert_eq!(session.messages.len(), 1);
    /// ```
    pub fn append(&mut self, mut message: Message) -> usize {
        let position = self.messages.len();
        message.position = position;
        self.messages.push(message);
        self.updated_at = Utc::now();
        position
    }

    /// Add a usage delta to the session's aggregate usage.
    pub fn record_usage(&mut self, delta: &TokenUsage) {
        self.usage.add(delta);
        self.updated_at = Utc::now();
    }

    /// The last `n` messages, in original order.
    ///
    /// Returns all messages when the session holds fewer than `n`.
    pub fn tail(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Get the number of messages in this session.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Check if this session is empty (no messages).
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get the last message in this session, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Whether new turns may be appended to this session.
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting new turns
    Active,
    /// Superseded by a continuation session; read-only for this core
    Forked,
    /// Closed by an external collaborator
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Forked => write!(f, "forked"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// A single message in a conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The text content of the message
    pub content: String,
    /// Insertion-ordered position within the owning session, assigned by
    /// [`Session::append`]
    #[serde(default)]
    pub position: usize,
    /// Per-message token count, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Set when the message captures partial output from a cancelled or
    /// dropped stream. Incomplete output is never presented as a complete
    /// answer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl Message {
    /// Create a new user message.
    ///
    /// # Example
    /// ```
    /// use flowcore::session::{Message, Role};
    ///
    /// let msg = Message::user("Hello!");
    /// assert_eq!(msg.role, Role::User);
    /// ```
    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
            position: 0,
            tokens: None,
            incomplete: false,
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: content.to_string(),
            position: 0,
            tokens: None,
            incomplete: false,
        }
    }

    /// Create a new system message.
    pub fn system(content: &str) -> Self {
        Self {
            role: Role::System,
            content: content.to_string(),
            position: 0,
            tokens: None,
            incomplete: false,
        }
    }

    /// Attach a known token count to this message.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Mark this message as capturing partial (incomplete) output.
    pub fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompts, instructions and fork summaries
    System,
    /// Messages from the user
    User,
    /// Messages from the AI assistant
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Token usage for a completed turn or a whole session.
///
/// `total_tokens` is always `input_tokens + output_tokens`; per-session
/// aggregates are monotonically non-decreasing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    /// Number of tokens consumed by the prompt
    pub input_tokens: u64,
    /// Number of tokens produced by the model
    pub output_tokens: u64,
    /// Total tokens (input + output)
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create new usage information. `total_tokens` is derived.
    ///
    /// # Example
    /// ```
    /// use flowcore::session::TokenUsage;
    ///
    /// let usage = TokenUsage::new(100, 50);
    /// assert_eq!(usage.total_tokens, 150);
    /// ```
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Accumulate another usage delta into this one.
    pub fn add(&mut self, delta: &TokenUsage) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
    }

    /// Whether any tokens have been recorded.
    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_new() {
        let session = Session::with_id("test-session");
        assert_eq!(session.id, "test-session");
        assert!(session.messages.is_empty());
        assert_eq!(session.state, SessionState::Active);
        assert!(session.usage.is_zero());
        assert!(session.created_at <= session.updated_at);
    }

    #[test]
    fn test_generated_ids_unique() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_append_assigns_positions() {
        let mut session = Session::with_id("test");
        assert_eq!(session.append(Message::user("one")), 0);
        assert_eq!(session.append(Message::assistant("two")), 1);
        assert_eq!(session.append(Message::user("three")), 2);

        // Total order, no shared positions
        let positions: Vec<usize> = session.messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_tail_is_contiguous_suffix() {
        let mut session = Session::with_id("test");
        for i in 0..5 {
            session.append(Message::user(&format!("msg {}", i)));
        }
        let tail = session.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "msg 3");
        assert_eq!(tail[1].content, "msg 4");

        // Tail larger than the session returns everything
        assert_eq!(session.tail(100).len(), 5);
    }

    #[test]
    fn test_record_usage_monotonic() {
        let mut session = Session::with_id("test");
        session.record_usage(&TokenUsage::new(10, 5));
        session.record_usage(&TokenUsage::new(20, 8));
        assert_eq!(session.usage.input_tokens, 30);
        assert_eq!(session.usage.output_tokens, 13);
        assert_eq!(session.usage.total_tokens, 43);
    }

    #[test]
    fn test_token_usage_invariant() {
        let mut usage = TokenUsage::new(7, 3);
        assert_eq!(usage.total_tokens, usage.input_tokens + usage.output_tokens);
        usage.add(&TokenUsage::new(100, 200));
        assert_eq!(usage.total_tokens, usage.input_tokens + usage.output_tokens);
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::assistant("hi").role, Role::Assistant);
        assert_eq!(Message::system("hi").role, Role::System);

        let msg = Message::assistant("partial").incomplete();
        assert!(msg.incomplete);

        let msg = Message::user("hi").with_tokens(4);
        assert_eq!(msg.tokens, Some(4));
    }

    #[test]
    fn test_incomplete_flag_serialization() {
        let msg = Message::assistant("full answer");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("incomplete"));

        let msg = Message::assistant("partial").incomplete();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"incomplete\":true"));
    }

    #[test]
    fn test_role_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), r#""user""#);
        assert_eq!(
            serde_json::to_string(&SessionState::Forked).unwrap(),
            r#""forked""#
        );
    }

    #[test]
    fn test_session_round_trip() {
        let mut session = Session::with_id("rt");
        session.append(Message::user("Hello"));
        session.append(Message::assistant("Hi!"));
        session.record_usage(&TokenUsage::new(12, 7));

        let json = serde_json::to_string(&session).unwrap();
        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "rt");
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.usage.total_tokens, 19);
        assert_eq!(parsed.messages[1].position, 1);
    }
}
