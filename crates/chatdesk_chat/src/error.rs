//! Error types for the chat system.

use thiserror::Error;

/// Chat system errors
#[derive(Error, Debug)]
pub enum ChatError {
    /// Message content was empty or whitespace only
    #[error("Message content must not be empty")]
    EmptyContent,

    /// No session identifier was supplied
    #[error("No chat session selected")]
    MissingSession,

    /// A request is already streaming for this session
    #[error("A response is already streaming; stop it before {0}")]
    Busy(String),

    /// Session id that cannot name a stored session
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// Session not found in the store
    #[error("Chat session not found: {0}")]
    SessionNotFound(String),

    /// Message not found in the local history
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Continuation requested for a message that is not partial
    #[error("Message is not partial and cannot be continued: {0}")]
    NotPartial(String),

    /// Streaming backend failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage backend failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

}

impl ChatError {
    /// Whether this error was raised before any side effect because the
    /// caller's input was rejected.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyContent | Self::MissingSession | Self::InvalidSessionId(_)
        )
    }
}

/// Result type for chat operations
pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(ChatError::EmptyContent.is_validation());
        assert!(ChatError::MissingSession.is_validation());
        assert!(ChatError::InvalidSessionId("..".to_string()).is_validation());
        assert!(!ChatError::Busy("sending".to_string()).is_validation());
        assert!(!ChatError::Transport("boom".to_string()).is_validation());
    }

    #[test]
    fn test_busy_message() {
        let err = ChatError::Busy("sending a new message".to_string());
        assert_eq!(
            err.to_string(),
            "A response is already streaming; stop it before sending a new message"
        );
    }
}
