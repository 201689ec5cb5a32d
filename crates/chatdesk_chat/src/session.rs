//! Streaming chat session.
//!
//! [`ChatSession`] is the single authority over one session's history and
//! the exchange in progress. Callers issue commands (`send`, `stop`,
//! `continue_from`, `retry`) and pump [`ChatSession::next_event`] while a
//! reply is streaming; observers read [`SessionSnapshot`]s via `subscribe`.
//!
//! ```text
//!            send / retry / continue_from
//!   Idle ──────────────────────────────▶ Streaming ──complete──▶ Idle
//!    ▲                                    │     │
//!    │            stop (partial saved)    │     │ error
//!    └──────────── Stopped ◀──────────────┘     ▼
//!                                             Errored ──send / retry──▶ Streaming
//! ```
//!
//! Transport failures never surface as `Err`; they move the session to
//! `Errored`. Store failures are logged and leave the in-memory state as
//! the source of truth.
//!
//! Every state change is applied before the first await. The store writes
//! it implies are queued and drained in order; a drain interrupted by
//! cancellation resumes at the start of the next command or `next_event`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ChatConfig, ConcurrentSendPolicy, OptimisticPolicy};
use crate::error::{ChatError, ChatResult};
use crate::store::SessionStore;
use crate::streaming::{FinishedRequest, RequestKind, StreamPhase, StreamingState, StreamingView};
use crate::transport::{StreamEvent, StreamRequest, StreamTransport};
use crate::types::{Message, MessageRole, Session, SessionPatch};

/// Everything an observer needs to render a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: Session,
    pub messages: Vec<Message>,
    pub streaming: StreamingView,
}

/// Outcome of one pumped stream event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Text appended to the buffer
    Chunk(String),
    /// The reply finished; the final (or continued) assistant message
    Completed(Message),
    /// The reply failed; the session is now `Errored`
    Failed(String),
}

/// Store write waiting behind an applied state change
#[derive(Debug, Clone)]
enum PendingWrite {
    Message { message: Message, what: &'static str },
    Session(SessionPatch),
}

/// Derive a session title from the first user message
pub fn derive_title(content: &str, max_chars: usize, suffix: &str) -> String {
    let content = content.trim();
    if content.chars().count() > max_chars {
        let head: String = content.chars().take(max_chars).collect();
        format!("{}{}", head, suffix)
    } else {
        content.to_string()
    }
}

/// One open chat session and its streaming state machine
pub struct ChatSession {
    session: Session,
    messages: Vec<Message>,
    streaming: StreamingState,
    config: ChatConfig,
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn SessionStore>,
    snapshots: watch::Sender<SessionSnapshot>,
    pending: VecDeque<PendingWrite>,
}

impl ChatSession {
    /// Open a session, loading its metadata and history from the store
    pub async fn open(
        session_id: &str,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn SessionStore>,
        config: ChatConfig,
    ) -> ChatResult<Self> {
        if session_id.trim().is_empty() {
            return Err(ChatError::MissingSession);
        }

        let session = store.load_session(session_id).await?;
        let messages = store.load_messages(session_id).await?;
        debug!(session_id, messages = messages.len(), "Opened chat session");

        Ok(Self::new(session, messages, transport, store, config))
    }

    /// Build a session from already-loaded state
    pub fn new(
        session: Session,
        messages: Vec<Message>,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn SessionStore>,
        config: ChatConfig,
    ) -> Self {
        let streaming = StreamingState::default();
        let (snapshots, _) = watch::channel(SessionSnapshot {
            session: session.clone(),
            messages: messages.clone(),
            streaming: streaming.view(),
        });

        Self {
            session,
            messages,
            streaming,
            config,
            transport,
            store,
            snapshots,
            pending: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn phase(&self) -> StreamPhase {
        self.streaming.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_streaming()
    }

    pub fn streaming(&self) -> StreamingView {
        self.streaming.view()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            messages: self.messages.clone(),
            streaming: self.streaming.view(),
        }
    }

    /// Watch snapshots; a new one is published on every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Most recent partial assistant message, if any
    pub fn last_partial(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.is_partial)
    }

    /// Store writes not yet attempted
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Publish a streaming-only change without copying the history
    fn publish_streaming(&self) {
        let view = self.streaming.view();
        self.snapshots.send_modify(|snapshot| snapshot.streaming = view);
    }

    fn position(&self, message_id: &str) -> ChatResult<usize> {
        self.messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))
    }

    /// Send a user message and start streaming the reply.
    ///
    /// Validation and busy errors are returned before any side effect. A
    /// transport that fails to open leaves the session `Errored` and still
    /// returns `Ok`.
    pub async fn send(
        &mut self,
        content: &str,
        personality_id: Option<String>,
        provider_id: Option<String>,
    ) -> ChatResult<()> {
        if self.session.id.trim().is_empty() {
            return Err(ChatError::MissingSession);
        }
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        self.flush_writes().await;
        self.ensure_available("sending a new message").await?;

        let first_exchange = !self
            .messages
            .iter()
            .any(|m| m.role == MessageRole::Assistant);

        let user_message = Message::user(&self.session.id, content)
            .with_provenance(personality_id.clone(), provider_id.clone());
        let user_message_id = user_message.id.clone();

        info!(
            session_id = %self.session.id,
            message_id = %user_message_id,
            personality = ?personality_id,
            provider = ?provider_id,
            "Sending message"
        );

        self.messages.push(user_message.clone());
        self.queue_message(user_message, "user message");
        self.publish();

        let request = StreamRequest {
            session_id: self.session.id.clone(),
            content: content.to_string(),
            personality_id: personality_id.clone(),
            provider_id: provider_id.clone(),
            user_id: self.config.user_id.clone(),
            is_continuation: false,
            partial_content: None,
        };

        let opened = self
            .start(
                request,
                RequestKind::Reply {
                    user_message_id: user_message_id.clone(),
                    first_exchange,
                },
                String::new(),
                personality_id,
                provider_id,
            )
            .await;

        if !opened && self.config.on_transport_error == OptimisticPolicy::Remove {
            self.messages.retain(|m| m.id != user_message_id);
            self.pending.retain(|write| {
                !matches!(write, PendingWrite::Message { message, .. } if message.id == user_message_id)
            });
            debug!(message_id = %user_message_id, "Dropped optimistic message after failed send");
            self.publish();
        }

        self.flush_writes().await;
        Ok(())
    }

    /// Stop the streaming reply.
    ///
    /// Text received so far is saved as a partial assistant message (or
    /// extends the partial being continued), which is returned. No-op when
    /// nothing is streaming.
    pub async fn stop(&mut self) -> Option<Message> {
        if !self.streaming.is_streaming() {
            return None;
        }

        let Some(finished) = self.streaming.finish(StreamPhase::Stopped) else {
            self.streaming.reset();
            return None;
        };
        info!(
            session_id = %self.session.id,
            buffered = finished.buffer.len(),
            "Stopped streaming"
        );

        let partial = self.flush_partial(finished);
        self.publish();
        self.streaming.reset();
        self.publish();

        let id = partial.map(|message| {
            let id = message.id.clone();
            self.queue_message(message, "partial message");
            id
        });
        self.flush_writes().await;

        let id = id?;
        self.messages.iter().find(|m| m.id == id).cloned()
    }

    /// Resume a partial assistant message.
    ///
    /// The buffer starts from the partial text; on completion the same
    /// message is updated in place.
    pub async fn continue_from(&mut self, message_id: &str) -> ChatResult<()> {
        let idx = self.position(message_id)?;
        if !self.messages[idx].is_partial {
            return Err(ChatError::NotPartial(message_id.to_string()));
        }
        self.flush_writes().await;
        self.ensure_available("continuing a message").await?;

        // A stop above may have grown the partial
        let idx = self.position(message_id)?;
        let partial = self.messages[idx].clone();

        info!(
            session_id = %self.session.id,
            message_id,
            partial_len = partial.content.len(),
            "Continuing partial message"
        );

        let request = StreamRequest {
            session_id: self.session.id.clone(),
            content: self.config.continuation_content(&partial.content),
            personality_id: partial.personality_id.clone(),
            provider_id: partial.provider_id.clone(),
            user_id: self.config.user_id.clone(),
            is_continuation: true,
            partial_content: Some(partial.content.clone()),
        };

        self.start(
            request,
            RequestKind::Continuation {
                message_id: message_id.to_string(),
            },
            partial.content,
            partial.personality_id,
            partial.provider_id,
        )
        .await;

        Ok(())
    }

    /// Resend the user message behind `message_id`.
    ///
    /// For an assistant message the nearest preceding user message is used.
    /// The originals are left in history; a new exchange is appended.
    pub async fn retry(&mut self, message_id: &str) -> ChatResult<()> {
        let idx = self.position(message_id)?;
        let source = self.messages[..=idx]
            .iter()
            .rev()
            .find(|m| m.is_user())
            .cloned()
            .ok_or_else(|| ChatError::MessageNotFound(format!("user message before {}", message_id)))?;

        info!(
            session_id = %self.session.id,
            message_id,
            source_id = %source.id,
            "Retrying message"
        );

        self.send(&source.content, source.personality_id, source.provider_id)
            .await
    }

    /// Retry the latest message in history
    pub async fn retry_last(&mut self) -> ChatResult<()> {
        let last = self
            .messages
            .last()
            .map(|m| m.id.clone())
            .ok_or_else(|| ChatError::MessageNotFound("no messages to retry".to_string()))?;
        self.retry(&last).await
    }

    /// Clear an error without retrying
    pub fn dismiss_error(&mut self) {
        if self.streaming.phase == StreamPhase::Errored {
            self.streaming.reset();
            self.publish();
        }
    }

    /// Reload history from the store, discarding local divergence
    pub async fn reload(&mut self) -> ChatResult<()> {
        if self.streaming.is_streaming() {
            return Err(ChatError::Busy("reloading history".to_string()));
        }
        self.flush_writes().await;
        self.session = self.store.load_session(&self.session.id).await?;
        self.messages = self.store.load_messages(&self.session.id).await?;
        self.publish();
        Ok(())
    }

    /// Wait for and apply the next stream event.
    ///
    /// Returns `None` when nothing is streaming. Cancel-safe, so it can be
    /// raced against user input in `tokio::select!`: an event is applied
    /// to the session before any store write is awaited.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.flush_writes().await;

        let idle_timeout = self.config.stream_idle_timeout();
        let active = self.streaming.active.as_mut()?;

        let event = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, active.handle.next_event()).await {
                Ok(event) => event,
                Err(_) => Some(StreamEvent::error(format!(
                    "No response from the server for {} seconds",
                    limit.as_secs()
                ))),
            },
            None => active.handle.next_event().await,
        };

        let terminal = match event {
            Some(StreamEvent::Chunk(text)) => {
                self.streaming.buffered_content.push_str(&text);
                debug!(session_id = %self.session.id, len = text.len(), "Chunk received");
                self.publish_streaming();
                return Some(SessionEvent::Chunk(text));
            }
            other => other,
        };

        let finished = self.streaming.finish(StreamPhase::Idle)?;
        let outcome = match terminal {
            Some(StreamEvent::Complete { metadata }) => self.complete(finished, metadata),
            Some(StreamEvent::Error(error)) => self.fail(finished, error),
            _ => self.fail(finished, "Stream ended before the response was complete".to_string()),
        };
        self.flush_writes().await;
        Some(outcome)
    }

    /// Pump events until the current reply settles.
    ///
    /// Returns the terminal event, or `None` if nothing was streaming.
    pub async fn finish(&mut self) -> Option<SessionEvent> {
        let mut last = None;
        while let Some(event) = self.next_event().await {
            let terminal = !matches!(event, SessionEvent::Chunk(_));
            last = Some(event);
            if terminal {
                break;
            }
        }
        last
    }

    /// Stop anything in flight, finish queued writes and give up the session
    pub async fn close(mut self) -> Option<Message> {
        let partial = self.stop().await;
        self.flush_writes().await;
        partial
    }

    async fn ensure_available(&mut self, operation: &str) -> ChatResult<()> {
        if !self.streaming.is_streaming() {
            return Ok(());
        }
        match self.config.concurrent_send {
            ConcurrentSendPolicy::Reject => Err(ChatError::Busy(operation.to_string())),
            ConcurrentSendPolicy::StopFirst => {
                self.stop().await;
                Ok(())
            }
        }
    }

    /// Open the transport and enter `Streaming`; on failure enter `Errored`.
    /// Returns whether the request started.
    async fn start(
        &mut self,
        request: StreamRequest,
        kind: RequestKind,
        seed: String,
        personality_id: Option<String>,
        provider_id: Option<String>,
    ) -> bool {
        match self.transport.open(request).await {
            Ok(handle) => {
                self.streaming
                    .begin(handle, kind, seed, personality_id, provider_id);
                self.publish();
                true
            }
            Err(e) => {
                warn!(session_id = %self.session.id, error = %e, "Failed to open stream");
                self.streaming.fail(e.to_string());
                self.publish();
                false
            }
        }
    }

    fn complete(
        &mut self,
        finished: FinishedRequest,
        metadata: Option<serde_json::Value>,
    ) -> SessionEvent {
        let FinishedRequest {
            kind,
            buffer,
            personality_id,
            provider_id,
        } = finished;

        let message = match kind {
            RequestKind::Reply {
                user_message_id,
                first_exchange,
            } => {
                let mut message = Message::assistant(&self.session.id, buffer)
                    .with_provenance(personality_id.clone(), provider_id.clone());
                message.metadata = metadata;
                self.messages.push(message.clone());
                self.queue_message(message.clone(), "assistant message");

                if let Some(patch) =
                    self.exchange_patch(&user_message_id, first_exchange, personality_id, provider_id)
                {
                    self.pending.push_back(PendingWrite::Session(patch));
                }

                info!(
                    session_id = %self.session.id,
                    message_id = %message.id,
                    len = message.content.len(),
                    "Reply completed"
                );
                message
            }
            RequestKind::Continuation { message_id } => {
                let message = match self.messages.iter().position(|m| m.id == message_id) {
                    Some(idx) => {
                        let existing = &mut self.messages[idx];
                        existing.content = buffer;
                        existing.is_partial = false;
                        existing.updated_at = Utc::now();
                        if metadata.is_some() {
                            existing.metadata = metadata;
                        }
                        existing.clone()
                    }
                    None => {
                        warn!(message_id = %message_id, "Continued message vanished; appending reply");
                        let mut message = Message::assistant(&self.session.id, buffer)
                            .with_provenance(personality_id, provider_id);
                        message.metadata = metadata;
                        self.messages.push(message.clone());
                        message
                    }
                };
                self.queue_message(message.clone(), "continued message");

                info!(
                    session_id = %self.session.id,
                    message_id = %message.id,
                    len = message.content.len(),
                    "Continuation completed"
                );
                message
            }
        };

        self.streaming.reset();
        self.publish();
        SessionEvent::Completed(message)
    }

    fn fail(&mut self, finished: FinishedRequest, error: String) -> SessionEvent {
        warn!(session_id = %self.session.id, error = %error, "Stream failed");

        if let Some(partial) = self.flush_partial(finished) {
            self.queue_message(partial, "partial message");
        }
        self.streaming.fail(error.clone());
        self.publish();

        SessionEvent::Failed(error)
    }

    /// Move buffered text into history as a partial message. Returns the
    /// message to persist, if anything changed.
    fn flush_partial(&mut self, finished: FinishedRequest) -> Option<Message> {
        let FinishedRequest {
            kind,
            buffer,
            personality_id,
            provider_id,
        } = finished;

        if buffer.is_empty() {
            return None;
        }

        if let RequestKind::Continuation { message_id } = kind {
            if let Some(idx) = self.messages.iter().position(|m| m.id == message_id) {
                let existing = &mut self.messages[idx];
                if existing.content == buffer {
                    return None;
                }
                existing.content = buffer;
                existing.updated_at = Utc::now();
                return Some(existing.clone());
            }
        }

        let message = Message::assistant(&self.session.id, buffer)
            .with_provenance(personality_id, provider_id)
            .partial();
        self.messages.push(message.clone());
        Some(message)
    }

    fn queue_message(&mut self, message: Message, what: &'static str) {
        self.pending.push_back(PendingWrite::Message { message, what });
    }

    /// Drain queued store writes in order.
    ///
    /// A write is dequeued only once attempted, so a cancelled drain
    /// retries it next time. Saves are upserts, making a repeat harmless.
    pub async fn flush_writes(&mut self) {
        while let Some(write) = self.pending.front().cloned() {
            match write {
                PendingWrite::Message { message, what } => self.write_message(message, what).await,
                PendingWrite::Session(patch) => self.write_session(patch).await,
            }
            self.pending.pop_front();
        }
    }

    /// Save through the store, adopting the stored copy on success
    async fn write_message(&mut self, message: Message, what: &str) {
        match self.store.save_message(&message).await {
            Ok(stored) => {
                if let Some(local) = self.messages.iter_mut().find(|m| m.id == stored.id) {
                    *local = stored;
                }
                self.publish();
            }
            Err(e) => warn!(
                session_id = %self.session.id,
                message_id = %message.id,
                error = %e,
                "Failed to persist {}; keeping local copy",
                what
            ),
        }
    }

    async fn write_session(&mut self, patch: SessionPatch) {
        match self.store.update_session(&self.session.id, patch).await {
            Ok(session) => {
                self.session = session;
                self.publish();
            }
            Err(e) => warn!(
                session_id = %self.session.id,
                error = %e,
                "Failed to update session metadata"
            ),
        }
    }

    /// Apply last-used settings and the auto-title locally after a
    /// completed reply; returns the patch to store, if any
    fn exchange_patch(
        &mut self,
        user_message_id: &str,
        first_exchange: bool,
        personality_id: Option<String>,
        provider_id: Option<String>,
    ) -> Option<SessionPatch> {
        let mut patch = SessionPatch {
            title: None,
            last_used_personality_id: personality_id,
            last_used_provider_id: provider_id,
        };

        if first_exchange && self.session.title == self.config.default_title {
            if let Some(user) = self.messages.iter().find(|m| m.id == user_message_id) {
                patch.title = Some(derive_title(
                    &user.content,
                    self.config.title_max_chars,
                    &self.config.title_suffix,
                ));
            }
        }

        if patch.is_empty() {
            return None;
        }
        self.session.apply(&patch);
        Some(patch)
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("session", &self.session.id)
            .field("messages", &self.messages.len())
            .field("phase", &self.streaming.phase)
            .field("pending_writes", &self.pending.len())
            .finish()
    }
}
