//! Chat and transport configuration.
//!
//! Settings live in the workspace under `.chatdesk/settings.json`:
//!
//! ```text
//! {
//!   "chat": { "defaultTitle": "New Chat", "concurrentSend": "reject", ... },
//!   "transport": { "baseUrl": "http://localhost:3000", "streamPath": "/api/chat/stream" }
//! }
//! ```
//!
//! Environment variables override the file:
//! `CHATDESK_API_URL`, `CHATDESK_API_KEY`, `CHATDESK_USER_ID`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

pub const DEFAULT_TITLE: &str = "New Chat";
pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;
pub const DEFAULT_CONTINUATION_PROMPT: &str = "Continue your previous response exactly where it left off. \
Do not repeat any of the text already written.\n\nYour response so far:\n{partial}";

/// What to do when a send/continue arrives while a response is streaming
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConcurrentSendPolicy {
    /// Refuse with `ChatError::Busy`
    #[default]
    Reject,
    /// Stop the active response (saving any partial) and proceed
    StopFirst,
}

/// What happens to the optimistic user message when the transport fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum OptimisticPolicy {
    /// Keep it in history so it can be retried
    #[default]
    Retain,
    /// Drop it from local history
    Remove,
}

/// Behaviour knobs for a chat session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatConfig {
    /// Placeholder title that marks a session as not yet titled
    pub default_title: String,
    /// Maximum characters taken from the first message for a title
    pub title_max_chars: usize,
    /// Appended when the first message is truncated
    pub title_suffix: String,
    /// Sent with every stream request
    pub user_id: String,
    pub concurrent_send: ConcurrentSendPolicy,
    pub on_transport_error: OptimisticPolicy,
    /// Fail a stream that stays silent this long. Off when unset.
    pub stream_idle_timeout_secs: Option<u64>,
    /// Template for continuation requests; `{partial}` is replaced by the partial text
    pub continuation_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_title: DEFAULT_TITLE.to_string(),
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
            title_suffix: "...".to_string(),
            user_id: "local".to_string(),
            concurrent_send: ConcurrentSendPolicy::default(),
            on_transport_error: OptimisticPolicy::default(),
            stream_idle_timeout_secs: None,
            continuation_prompt: DEFAULT_CONTINUATION_PROMPT.to_string(),
        }
    }
}

impl ChatConfig {
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Render the continuation instruction for a partial reply
    pub fn continuation_content(&self, partial: &str) -> String {
        self.continuation_prompt.replace("{partial}", partial)
    }
}

/// Where the streaming backend lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    pub base_url: String,
    pub stream_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            stream_path: "/api/chat/stream".to_string(),
            api_key: None,
        }
    }
}

impl TransportSettings {
    /// Full URL of the streaming endpoint
    pub fn stream_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.stream_path.trim_start_matches('/')
        )
    }
}

/// Combined settings file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub chat: ChatConfig,
    pub transport: TransportSettings,
}

impl Settings {
    /// Path of the settings file for a workspace
    pub fn path(workspace_root: &Path) -> std::path::PathBuf {
        workspace_root.join(".chatdesk").join("settings.json")
    }

    /// Load settings from the workspace, then apply environment overrides.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn from_settings(workspace_root: &Path) -> ChatResult<Self> {
        let settings_path = Self::path(workspace_root);

        let settings = if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            serde_json::from_str(&content).map_err(|e| {
                ChatError::Config(format!("{}: {}", settings_path.display(), e))
            })?
        } else {
            Self::default()
        };

        Ok(settings.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup; empty values are ignored
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("CHATDESK_API_URL") {
            self.transport.base_url = url;
        }
        if let Some(key) = get("CHATDESK_API_KEY") {
            self.transport.api_key = Some(key);
        }
        if let Some(user) = get("CHATDESK_USER_ID") {
            self.chat.user_id = user;
        }
        self
    }

    /// Persist settings to the workspace
    pub fn save(&self, workspace_root: &Path) -> ChatResult<()> {
        let settings_path = Self::path(workspace_root);
        if let Some(parent) = settings_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(settings_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.default_title, "New Chat");
        assert_eq!(config.title_max_chars, 50);
        assert_eq!(config.concurrent_send, ConcurrentSendPolicy::Reject);
        assert_eq!(config.on_transport_error, OptimisticPolicy::Retain);
        assert_eq!(config.stream_idle_timeout(), None);
    }

    #[test]
    fn test_zero_timeout_means_off() {
        let config = ChatConfig {
            stream_idle_timeout_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(config.stream_idle_timeout(), None);

        let config = ChatConfig {
            stream_idle_timeout_secs: Some(30),
            ..Default::default()
        };
        assert_eq!(config.stream_idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_continuation_content() {
        let config = ChatConfig {
            continuation_prompt: "Continue: {partial}".to_string(),
            ..Default::default()
        };
        assert_eq!(config.continuation_content("Hello, world"), "Continue: Hello, world");
    }

    #[test]
    fn test_stream_url_joins_slashes() {
        let transport = TransportSettings {
            base_url: "http://example.test/".to_string(),
            stream_path: "/api/stream".to_string(),
            api_key: None,
        };
        assert_eq!(transport.stream_url(), "http://example.test/api/stream");
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::default().with_env_overrides(|key| match key {
            "CHATDESK_API_URL" => Some("https://chat.example.test".to_string()),
            "CHATDESK_API_KEY" => Some("  ".to_string()),
            "CHATDESK_USER_ID" => Some("user-7".to_string()),
            _ => None,
        });

        assert_eq!(settings.transport.base_url, "https://chat.example.test");
        assert_eq!(settings.transport.api_key, None);
        assert_eq!(settings.chat.user_id, "user-7");
    }

    #[test]
    fn test_partial_settings_file() {
        let temp = tempdir().unwrap();
        let path = Settings::path(temp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"chat": {"concurrentSend": "stopFirst", "streamIdleTimeoutSecs": 45}}"#,
        )
        .unwrap();

        let settings: Settings =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(settings.chat.concurrent_send, ConcurrentSendPolicy::StopFirst);
        assert_eq!(settings.chat.stream_idle_timeout_secs, Some(45));
        assert_eq!(settings.chat.default_title, "New Chat");
        assert_eq!(settings.transport, TransportSettings::default());
    }

    #[test]
    fn test_malformed_settings_file() {
        let temp = tempdir().unwrap();
        let path = Settings::path(temp.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        let err = Settings::from_settings(temp.path()).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_save_round_trip() {
        let temp = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.chat.on_transport_error = OptimisticPolicy::Remove;
        settings.save(temp.path()).unwrap();

        let content = std::fs::read_to_string(Settings::path(temp.path())).unwrap();
        let loaded: Settings = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded.chat.on_transport_error, OptimisticPolicy::Remove);
    }
}
