//! Core types for the chat system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a chat session
pub type SessionId = String;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique message ID (UUID)
    pub id: String,
    /// Owning session
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    /// Role of the message sender
    pub role: MessageRole,
    /// Message content (markdown)
    pub content: String,
    /// Personality used to produce (or requested for) this message
    #[serde(rename = "personalityId", default, skip_serializing_if = "Option::is_none")]
    pub personality_id: Option<String>,
    /// Provider used to produce (or requested for) this message
    #[serde(rename = "providerId", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// When the message was created
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// When the message was last changed
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Assistant reply cut short by a stop and saved incomplete
    #[serde(rename = "isPartial", default)]
    pub is_partial: bool,
    /// Backend metadata attached after completion (usage, model, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    fn new(session_id: &str, role: MessageRole, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.into(),
            personality_id: None,
            provider_id: None,
            created_at: now,
            updated_at: now,
            is_partial: false,
            metadata: None,
        }
    }

    /// Create a new user message
    pub fn user(session_id: &str, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::User, content)
    }

    /// Create a new assistant message
    pub fn assistant(session_id: &str, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::Assistant, content)
    }

    /// Attach personality/provider provenance
    pub fn with_provenance(mut self, personality_id: Option<String>, provider_id: Option<String>) -> Self {
        self.personality_id = personality_id;
        self.provider_id = provider_id;
        self
    }

    /// Mark the message as partial (stopped before completion)
    pub fn partial(mut self) -> Self {
        self.is_partial = true;
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }
}

/// A chat session as known to the store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,
    /// Display title
    pub title: String,
    #[serde(rename = "lastUsedPersonalityId", default, skip_serializing_if = "Option::is_none")]
    pub last_used_personality_id: Option<String>,
    #[serde(rename = "lastUsedAIProviderId", default, skip_serializing_if = "Option::is_none")]
    pub last_used_provider_id: Option<String>,
    /// When the session was created
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// When the session was last updated
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session with the given title
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            last_used_personality_id: None,
            last_used_provider_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a patch in place, bumping `updated_at`
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(ref title) = patch.title {
            self.title = title.clone();
        }
        if let Some(ref personality) = patch.last_used_personality_id {
            self.last_used_personality_id = Some(personality.clone());
        }
        if let Some(ref provider) = patch.last_used_provider_id {
            self.last_used_provider_id = Some(provider.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of session metadata. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "lastUsedPersonalityId", default, skip_serializing_if = "Option::is_none")]
    pub last_used_personality_id: Option<String>,
    #[serde(rename = "lastUsedAIProviderId", default, skip_serializing_if = "Option::is_none")]
    pub last_used_provider_id: Option<String>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.last_used_personality_id.is_none()
            && self.last_used_provider_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("s1", "Hello");
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.content, "Hello");
        assert_eq!(msg.session_id, "s1");
        assert!(!msg.is_partial);

        let msg = Message::assistant("s1", "Hi there!").partial();
        assert_eq!(msg.role, MessageRole::Assistant);
        assert!(msg.is_partial);
    }

    #[test]
    fn test_message_wire_names() {
        let msg = Message::assistant("s1", "Hi")
            .with_provenance(Some("tutor".to_string()), None)
            .partial();
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["personalityId"], "tutor");
        assert_eq!(json["isPartial"], true);
        assert!(json.get("providerId").is_none());
    }

    #[test]
    fn test_session_patch() {
        let mut session = Session::new("New Chat");
        let before = session.updated_at;

        session.apply(&SessionPatch {
            title: Some("Recursion".to_string()),
            last_used_personality_id: None,
            last_used_provider_id: Some("openai".to_string()),
        });

        assert_eq!(session.title, "Recursion");
        assert_eq!(session.last_used_personality_id, None);
        assert_eq!(session.last_used_provider_id.as_deref(), Some("openai"));
        assert!(session.updated_at >= before);
        assert!(SessionPatch::default().is_empty());
    }

    #[test]
    fn test_patch_provider_wire_name() {
        let patch = SessionPatch {
            last_used_provider_id: Some("anthropic".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"lastUsedAIProviderId":"anthropic"}"#);
    }
}
