//! Active session tracking.
//!
//! At most one [`ChatSession`] is active at a time. Switching opens the
//! target first, then stops the previous one so its partial reply is saved
//! and its stream is released.

use std::sync::Arc;

use tracing::info;

use crate::config::ChatConfig;
use crate::error::ChatResult;
use crate::session::ChatSession;
use crate::store::SessionStore;
use crate::transport::StreamTransport;
use crate::types::Message;

/// Owns the shared transport and store and the currently active session
pub struct ChatManager {
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn SessionStore>,
    config: ChatConfig,
    active: Option<ChatSession>,
}

impl ChatManager {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn SessionStore>,
        config: ChatConfig,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            active: None,
        }
    }

    pub fn active(&self) -> Option<&ChatSession> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ChatSession> {
        self.active.as_mut()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Make `session_id` the active session.
    ///
    /// On failure the current session stays active. Switching to the
    /// session that is already active is a no-op.
    pub async fn switch_to(&mut self, session_id: &str) -> ChatResult<&mut ChatSession> {
        let next = match self.active.take() {
            Some(current) if current.id() == session_id => current,
            previous => {
                let opened = ChatSession::open(
                    session_id,
                    self.transport.clone(),
                    self.store.clone(),
                    self.config.clone(),
                )
                .await;
                let next = match opened {
                    Ok(next) => next,
                    Err(e) => {
                        self.active = previous;
                        return Err(e);
                    }
                };

                if let Some(previous) = previous {
                    let previous_id = previous.id().to_string();
                    let partial = previous.close().await;
                    info!(
                        from = %previous_id,
                        to = %session_id,
                        saved_partial = partial.is_some(),
                        "Switched session"
                    );
                }
                next
            }
        };

        Ok(self.active.insert(next))
    }

    /// Stop and release the active session; returns the partial it saved
    pub async fn close_active(&mut self) -> Option<Message> {
        let session = self.active.take()?;
        session.close().await
    }
}

impl std::fmt::Debug for ChatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatManager")
            .field("active", &self.active.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::mock::{MemorySessionStore, ScriptedTransport};
    use crate::streaming::StreamPhase;
    use crate::transport::StreamEvent;
    use crate::types::Session;

    fn manager(transport: &ScriptedTransport, store: &MemorySessionStore) -> ChatManager {
        ChatManager::new(
            Arc::new(transport.clone()),
            Arc::new(store.clone()),
            ChatConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_switch_aborts_in_flight_stream() {
        let transport = ScriptedTransport::new().push_events(vec![StreamEvent::chunk("Half an ans")]);
        let store = MemorySessionStore::new();
        let first = Session::new("New Chat");
        let second = Session::new("New Chat");
        store.insert_session(first.clone());
        store.insert_session(second.clone());

        let mut manager = manager(&transport, &store);
        let chat = manager.switch_to(&first.id).await.unwrap();
        chat.send("question", None, None).await.unwrap();
        chat.next_event().await.unwrap();
        assert_eq!(transport.live_handles(), 1);

        let chat = manager.switch_to(&second.id).await.unwrap();
        assert_eq!(chat.id(), second.id);
        assert_eq!(chat.phase(), StreamPhase::Idle);
        assert_eq!(transport.live_handles(), 0);
        assert_eq!(transport.abort_count(), 1);

        let saved = store.stored_messages(&first.id);
        assert_eq!(saved.len(), 2);
        assert!(saved[1].is_partial);
        assert_eq!(saved[1].content, "Half an ans");
        assert!(store.stored_messages(&second.id).is_empty());
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_current_session() {
        let transport = ScriptedTransport::new();
        let store = MemorySessionStore::new();
        let session = Session::new("New Chat");
        store.insert_session(session.clone());

        let mut manager = manager(&transport, &store);
        manager.switch_to(&session.id).await.unwrap();

        let err = manager.switch_to("missing").await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(_)));
        assert_eq!(manager.active().map(|s| s.id()), Some(session.id.as_str()));
    }

    #[tokio::test]
    async fn test_switch_to_same_session_keeps_stream() {
        let transport = ScriptedTransport::new();
        let store = MemorySessionStore::new();
        let session = Session::new("New Chat");
        store.insert_session(session.clone());

        let mut manager = manager(&transport, &store);
        manager
            .switch_to(&session.id)
            .await
            .unwrap()
            .send("hello", None, None)
            .await
            .unwrap();

        let chat = manager.switch_to(&session.id).await.unwrap();
        assert!(chat.is_streaming());
        assert_eq!(transport.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_close_active() {
        let transport = ScriptedTransport::new();
        let store = MemorySessionStore::new();
        let session = Session::new("New Chat");
        store.insert_session(session.clone());

        let mut manager = manager(&transport, &store);
        manager
            .switch_to(&session.id)
            .await
            .unwrap()
            .send("hello", None, None)
            .await
            .unwrap();
        transport.last_sender().unwrap().chunk("partial");
        manager.active_mut().unwrap().next_event().await.unwrap();

        let partial = manager.close_active().await.unwrap();
        assert_eq!(partial.content, "partial");
        assert!(manager.active().is_none());
        assert_eq!(transport.live_handles(), 0);
    }
}
