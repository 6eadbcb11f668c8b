//! Session module - conversation state and the persistence boundary
//!
//! This module defines the session data model and the [`SessionStore`]
//! boundary trait this core consumes for persistence. The core treats
//! storage as a durable key-value append log and never assumes a specific
//! technology; [`MemoryStore`] is the in-memory reference implementation
//! used by tests and by embedders that handle durability elsewhere.
//!
//! # Example
//!
//! ```
//! use flowcore::session::{MemoryStore, SessionStore, Session, Message};
//!
//! #[tokio::main]
//! async fn main() -> flowcore::Result<()> {
//!     let store = MemoryStore::new();
//!     let session = Session::with_id("chat-123");
//!     store.create(session).await?;
//!
//!     store.append_message("chat-123", Message::user("Hello!")).await?;
//!     let session = store.load("chat-123").await?.unwrap();
//!     assert_eq!(session.messages.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod types;

pub use types::{Message, Role, Session, SessionState, TokenUsage};

use crate::error::{FlowError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence boundary for sessions.
///
/// Implementations must keep each session's message sequence append-only
/// and totally ordered: positions are assigned under the store's own
/// synchronization so that no two messages in the same session share one.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session by id.
    async fn load(&self, id: &str) -> Result<Option<Session>>;

    /// Persist a newly created session.
    ///
    /// Fails with [`FlowError::Session`] if the id already exists.
    async fn create(&self, session: Session) -> Result<()>;

    /// Append a message to an active session, assigning its position.
    ///
    /// Returns the message as stored (with its position filled in).
    /// Appending to a forked or closed session is an error.
    async fn append_message(&self, id: &str, message: Message) -> Result<Message>;

    /// Add a usage delta to the session's aggregate usage.
    ///
    /// Returns the new aggregate.
    async fn record_usage(&self, id: &str, delta: &TokenUsage) -> Result<TokenUsage>;

    /// Transition a session to a new lifecycle state.
    async fn set_state(&self, id: &str, state: SessionState) -> Result<()>;

    /// Load a session, failing with [`FlowError::SessionNotFound`] if absent.
    async fn require(&self, id: &str) -> Result<Session> {
        self.load(id)
            .await?
            .ok_or_else(|| FlowError::SessionNotFound(id.to_string()))
    }
}

/// In-memory session store.
///
/// Cloning is cheap and clones share state, making the store safe to hand
/// to multiple components.
#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an existing session or create a new active one with the given id.
    pub async fn get_or_create(&self, id: &str) -> Result<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(id) {
                return Ok(session.clone());
            }
        }
        let session = Session::with_id(id);
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(id.to_string())
            .or_insert(session)
            .clone())
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the store holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).cloned())
    }

    async fn create(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(FlowError::Session(format!(
                "session '{}' already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<Message> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| FlowError::SessionNotFound(id.to_string()))?;
        if !session.is_active() {
            return Err(FlowError::Session(format!(
                "session '{}' is {}, not accepting messages",
                id, session.state
            )));
        }
        let position = session.append(message);
        Ok(session.messages[position].clone())
    }

    async fn record_usage(&self, id: &str, delta: &TokenUsage) -> Result<TokenUsage> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| FlowError::SessionNotFound(id.to_string()))?;
        session.record_usage(delta);
        Ok(session.usage)
    }

    async fn set_state(&self, id: &str, state: SessionState) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| FlowError::SessionNotFound(id.to_string()))?;
        session.state = state;
        session.updated_at = chrono::Utc::now();
        Ok(())
    }
}
