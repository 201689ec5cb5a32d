//! In-memory transport and store for tests.
//!
//! [`ScriptedTransport`] plays back queued event scripts (or hands the test
//! a sender to drive manually) and captures every request.
//! [`MemorySessionStore`] keeps sessions in memory with optional write
//! failures. Both are cheap to clone; clones share state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ChatError, ChatResult};
use crate::store::SessionStore;
use crate::transport::{StreamEvent, StreamHandle, StreamRequest, StreamSender, StreamTransport};
use crate::types::{Message, Session, SessionPatch};

/// What the next `open` call does
#[derive(Debug, Clone)]
enum Script {
    /// Queue these events on the new handle
    Events(Vec<StreamEvent>),
    /// Fail to open with this message
    OpenFailure(String),
}

/// Decrements the live-handle count when the handle's abort action is run
/// or dropped
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted streaming transport.
///
/// Each `open` consumes the next script. With no script queued the handle
/// stays silent until the test pushes events through [`last_sender`].
///
/// [`last_sender`]: ScriptedTransport::last_sender
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    /// Scripts for upcoming opens.
    scripts: Arc<RwLock<VecDeque<Script>>>,
    /// Captured requests, in order.
    requests: Arc<RwLock<Vec<StreamRequest>>>,
    /// Producer side of every opened handle.
    senders: Arc<RwLock<Vec<StreamSender>>>,
    /// Handles opened and not yet finished or aborted.
    live: Arc<AtomicUsize>,
    /// Highest value `live` ever reached.
    max_live: Arc<AtomicUsize>,
    /// Number of aborted handles.
    aborts: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// Create a transport with no scripts
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply: the given chunks then a completion
    pub fn push_reply(self, chunks: &[&str]) -> Self {
        let mut events: Vec<_> = chunks.iter().map(|c| StreamEvent::chunk(*c)).collect();
        events.push(StreamEvent::complete());
        self.push_events(events)
    }

    /// Queue an arbitrary event script
    pub fn push_events(self, events: Vec<StreamEvent>) -> Self {
        self.scripts.write().push_back(Script::Events(events));
        self
    }

    /// Make the next open fail
    pub fn push_open_failure(self, message: impl Into<String>) -> Self {
        self.scripts
            .write()
            .push_back(Script::OpenFailure(message.into()));
        self
    }

    /// All captured requests, including ones that failed to open
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.read().clone()
    }

    pub fn open_count(&self) -> usize {
        self.requests.read().len()
    }

    /// Sender of the most recently opened handle
    pub fn last_sender(&self) -> Option<StreamSender> {
        self.senders.read().last().cloned()
    }

    /// Drop the transport's own senders so handles see end-of-stream once
    /// every other sender is gone
    pub fn close_all(&self) {
        self.senders.write().clear();
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, request: StreamRequest) -> ChatResult<StreamHandle> {
        self.requests.write().push(request);

        let script = self.scripts.write().pop_front();
        let events = match script {
            Some(Script::OpenFailure(message)) => return Err(ChatError::Transport(message)),
            Some(Script::Events(events)) => events,
            None => Vec::new(),
        };

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let sender = StreamSender::from(tx);
        for event in events {
            sender.send(event);
        }

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        let guard = LiveGuard(self.live.clone());
        let aborts = self.aborts.clone();
        let handle = StreamHandle::new(rx, move || {
            aborts.fetch_add(1, Ordering::SeqCst);
            drop(guard);
        });

        self.senders.write().push(sender);
        Ok(handle)
    }
}

/// In-memory session store
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    messages: Arc<RwLock<HashMap<String, Vec<Message>>>>,
    /// Every successful `save_message` call, in order.
    saved: Arc<RwLock<Vec<Message>>>,
    /// Every successful `update_session` call, in order.
    patches: Arc<RwLock<Vec<(String, SessionPatch)>>>,
    /// Simulated failure for writes.
    fail_writes: Arc<RwLock<Option<String>>>,
    /// Simulated latency before each write.
    write_delay: Arc<RwLock<Option<Duration>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session
    pub fn with_session(self, session: Session) -> Self {
        self.insert_session(session);
        self
    }

    pub fn insert_session(&self, session: Session) {
        self.messages.write().entry(session.id.clone()).or_default();
        self.sessions.write().insert(session.id.clone(), session);
    }

    /// Seed a message without recording it as a save
    pub fn insert_message(&self, message: Message) {
        self.messages
            .write()
            .entry(message.session_id.clone())
            .or_default()
            .push(message);
    }

    /// Make every write fail until cleared
    pub fn simulate_write_failure(&self, message: impl Into<String>) {
        *self.fail_writes.write() = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.fail_writes.write() = None;
    }

    /// Make every write wait this long before taking effect
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.write() = delay;
    }

    pub fn stored_messages(&self, session_id: &str) -> Vec<Message> {
        self.messages
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn saved_messages(&self) -> Vec<Message> {
        self.saved.read().clone()
    }

    pub fn session_patches(&self) -> Vec<(String, SessionPatch)> {
        self.patches.read().clone()
    }

    async fn delay_write(&self) {
        let delay = *self.write_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_writes(&self) -> ChatResult<()> {
        match self.fail_writes.read().as_ref() {
            Some(message) => Err(ChatError::Persistence(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session(&self, session_id: &str) -> ChatResult<Session> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))
    }

    async fn load_messages(&self, session_id: &str) -> ChatResult<Vec<Message>> {
        Ok(self.stored_messages(session_id))
    }

    async fn save_message(&self, message: &Message) -> ChatResult<Message> {
        self.delay_write().await;
        self.check_writes()?;
        if !self.sessions.read().contains_key(&message.session_id) {
            return Err(ChatError::SessionNotFound(message.session_id.clone()));
        }

        let mut messages = self.messages.write();
        let list = messages.entry(message.session_id.clone()).or_default();
        match list.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => list.push(message.clone()),
        }

        self.saved.write().push(message.clone());
        Ok(message.clone())
    }

    async fn update_session(&self, session_id: &str, patch: SessionPatch) -> ChatResult<Session> {
        self.delay_write().await;
        self.check_writes()?;

        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;
        session.apply(&patch);

        self.patches.write().push((session_id.to_string(), patch));
        Ok(session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StreamRequest {
        StreamRequest {
            session_id: "s1".to_string(),
            content: "hi".to_string(),
            personality_id: None,
            provider_id: None,
            user_id: "u1".to_string(),
            is_continuation: false,
            partial_content: None,
        }
    }

    #[tokio::test]
    async fn test_scripts_play_in_order() {
        let transport = ScriptedTransport::new()
            .push_open_failure("down")
            .push_reply(&["a"]);

        assert!(transport.open(request()).await.is_err());

        let mut handle = transport.open(request()).await.unwrap();
        assert_eq!(handle.next_event().await, Some(StreamEvent::chunk("a")));
        assert_eq!(handle.next_event().await, Some(StreamEvent::complete()));
        assert_eq!(transport.open_count(), 2);
        assert_eq!(transport.live_handles(), 0);
        assert_eq!(transport.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_live_handle_tracking() {
        let transport = ScriptedTransport::new();

        let mut first = transport.open(request()).await.unwrap();
        let second = transport.open(request()).await.unwrap();
        assert_eq!(transport.live_handles(), 2);
        assert_eq!(transport.max_live_handles(), 2);

        first.abort();
        drop(second);
        assert_eq!(transport.live_handles(), 0);
        assert_eq!(transport.abort_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_upserts() {
        let session = Session::new("New Chat");
        let store = MemorySessionStore::new().with_session(session.clone());

        let mut message = Message::assistant(&session.id, "Hello").partial();
        store.save_message(&message).await.unwrap();
        message.content.push('!');
        store.save_message(&message).await.unwrap();

        let stored = store.load_messages(&session.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "Hello!");
        assert_eq!(store.saved_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_failures() {
        let session = Session::new("New Chat");
        let store = MemorySessionStore::new().with_session(session.clone());

        store.simulate_write_failure("read-only");
        let err = store
            .save_message(&Message::user(&session.id, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Persistence(_)));

        store.clear_failure();
        store.save_message(&Message::user(&session.id, "hi")).await.unwrap();
        assert_eq!(store.stored_messages(&session.id).len(), 1);
    }
}
