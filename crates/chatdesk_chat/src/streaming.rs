//! Transient streaming state of one chat session.

use serde::{Deserialize, Serialize};

use crate::transport::StreamHandle;

/// Phase of the current exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    /// Observed only while a stop is being settled
    Stopped,
    Errored,
}

/// What the active request is producing
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// A fresh assistant reply to `user_message_id`; `first_exchange` when
    /// no assistant message existed before it
    Reply {
        user_message_id: String,
        first_exchange: bool,
    },
    /// Completion of an existing partial message
    Continuation { message_id: String },
}

/// The live request owned by a session
#[derive(Debug)]
pub(crate) struct ActiveRequest {
    pub handle: StreamHandle,
    pub kind: RequestKind,
}

/// A request taken out of the streaming state
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FinishedRequest {
    pub kind: RequestKind,
    pub buffer: String,
    pub personality_id: Option<String>,
    pub provider_id: Option<String>,
}

/// Streaming state machine data.
///
/// `buffered_content` is empty whenever the phase is not `Streaming`;
/// `active` is `Some` exactly while streaming.
#[derive(Debug, Default)]
pub(crate) struct StreamingState {
    pub phase: StreamPhase,
    pub buffered_content: String,
    pub error_message: Option<String>,
    pub personality_id: Option<String>,
    pub provider_id: Option<String>,
    pub active: Option<ActiveRequest>,
}

impl StreamingState {
    pub fn is_streaming(&self) -> bool {
        self.phase == StreamPhase::Streaming
    }

    /// Enter `Streaming`, taking ownership of the handle
    pub fn begin(
        &mut self,
        handle: StreamHandle,
        kind: RequestKind,
        seed: String,
        personality_id: Option<String>,
        provider_id: Option<String>,
    ) {
        self.phase = StreamPhase::Streaming;
        self.buffered_content = seed;
        self.error_message = None;
        self.personality_id = personality_id;
        self.provider_id = provider_id;
        self.active = Some(ActiveRequest { handle, kind });
    }

    /// Leave `Streaming`: abort and release the handle, hand back what the
    /// request was producing. `None` when nothing was active.
    pub fn finish(&mut self, phase: StreamPhase) -> Option<FinishedRequest> {
        self.phase = phase;
        let buffer = std::mem::take(&mut self.buffered_content);
        let personality_id = self.personality_id.take();
        let provider_id = self.provider_id.take();
        let mut active = self.active.take()?;
        active.handle.abort();
        Some(FinishedRequest {
            kind: active.kind.clone(),
            buffer,
            personality_id,
            provider_id,
        })
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.phase = StreamPhase::Errored;
        self.error_message = Some(message.into());
    }

    pub fn reset(&mut self) {
        self.phase = StreamPhase::Idle;
        self.error_message = None;
    }

    pub fn view(&self) -> StreamingView {
        StreamingView {
            phase: self.phase,
            buffered_content: self.buffered_content.clone(),
            can_stop: self.phase == StreamPhase::Streaming,
            can_retry: self.phase == StreamPhase::Errored,
            error_message: self.error_message.clone(),
            personality_id: self.personality_id.clone(),
            provider_id: self.provider_id.clone(),
            continuing_message_id: match self.active.as_ref().map(|a| &a.kind) {
                Some(RequestKind::Continuation { message_id }) => Some(message_id.clone()),
                _ => None,
            },
        }
    }
}

/// Read-only copy of the streaming state for observers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamingView {
    pub phase: StreamPhase,
    pub buffered_content: String,
    pub can_stop: bool,
    pub can_retry: bool,
    pub error_message: Option<String>,
    /// Personality badge for the in-flight reply
    pub personality_id: Option<String>,
    /// Provider badge for the in-flight reply
    pub provider_id: Option<String>,
    /// Set while a partial message is being continued
    pub continuing_message_id: Option<String>,
}
