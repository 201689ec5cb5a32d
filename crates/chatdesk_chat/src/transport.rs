//! Streaming transport contract.
//!
//! A transport opens one cancellable request per reply. The returned
//! [`StreamHandle`] yields zero or more [`StreamEvent::Chunk`]s followed by
//! exactly one terminal event (`Complete` or `Error`). Once the handle has
//! been aborted, or has yielded its terminal event, it yields nothing more.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChatResult;
use crate::types::SessionId;

/// Request sent to the streaming backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub session_id: SessionId,
    /// User content, or the continuation instruction for continuations
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personality_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub is_continuation: bool,
    /// Text already generated, for continuations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_content: Option<String>,
}

/// One event from an open stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A verbatim text fragment of the reply
    Chunk(String),
    /// The reply finished; optional backend metadata for the final message
    Complete { metadata: Option<serde_json::Value> },
    /// The reply failed
    Error(String),
}

impl StreamEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self::Chunk(content.into())
    }

    pub fn complete() -> Self {
        Self::Complete { metadata: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

type AbortFn = Box<dyn FnOnce() + Send>;

/// Cancellable handle over one streaming request
pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    on_abort: Option<AbortFn>,
    finished: bool,
}

impl StreamHandle {
    /// Wrap an event channel; `on_abort` runs at most once when the handle
    /// is aborted or dropped before finishing.
    pub fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        on_abort: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            on_abort: Some(Box::new(on_abort)),
            finished: false,
        }
    }

    /// Create a handle fed by the returned sender, with no abort action
    pub fn channel() -> (StreamSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamSender::from(tx), Self::new(rx, || {}))
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the terminal event has been delivered or the
    /// handle was aborted. A sender that goes away without a terminal event
    /// also yields `None`. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(e) if e.is_terminal() => self.finish(),
            None => self.finish(),
            _ => {}
        }
        event
    }

    /// Cancel the request. Idempotent; no event is yielded afterwards.
    pub fn abort(&mut self) {
        self.finished = true;
        self.events.close();
        if let Some(on_abort) = self.on_abort.take() {
            on_abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.on_abort = None;
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("finished", &self.finished)
            .finish()
    }
}

/// Producer side of a [`StreamHandle`]
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl From<mpsc::UnboundedSender<StreamEvent>> for StreamSender {
    fn from(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self { tx }
    }
}

impl StreamSender {
    /// Push an event; returns false if the handle is gone or aborted
    pub fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn chunk(&self, content: impl Into<String>) -> bool {
        self.send(StreamEvent::chunk(content))
    }

    pub fn complete(&self) -> bool {
        self.send(StreamEvent::complete())
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(StreamEvent::error(message))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Opens streaming requests against a backend
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a request. An `Err` means the request never started.
    async fn open(&self, request: StreamRequest) -> ChatResult<StreamHandle>;
}
