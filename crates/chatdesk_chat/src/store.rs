//! Session store contract.

use async_trait::async_trait;

use crate::error::ChatResult;
use crate::types::{Message, Session, SessionPatch};

/// Persistence for sessions and their messages.
///
/// Callers decide whether to retry failures; implementations should not
/// retry on their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load session metadata
    async fn load_session(&self, session_id: &str) -> ChatResult<Session>;

    /// Load all messages of a session, oldest first
    async fn load_messages(&self, session_id: &str) -> ChatResult<Vec<Message>>;

    /// Insert or replace a message by id; returns the stored copy
    async fn save_message(&self, message: &Message) -> ChatResult<Message>;

    /// Apply a metadata patch; returns the updated session
    async fn update_session(&self, session_id: &str, patch: SessionPatch) -> ChatResult<Session>;
}
