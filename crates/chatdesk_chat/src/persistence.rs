//! File-backed session store.
//!
//! Chat sessions are stored in the workspace under:
//! `.chatdesk/sessions/<sessionId>/`
//!
//! Directory structure:
//! ```text
//! .chatdesk/sessions/<sessionId>/
//! ├── session.json       # Session metadata (title, last-used settings)
//! └── messages.jsonl     # Append-only message revisions
//! ```
//!
//! Saving a message appends a new revision. Loading folds revisions by id:
//! the last revision wins and messages keep the position of their first
//! revision.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::store::SessionStore;
use crate::types::{Message, Session, SessionPatch};

/// JSONL store rooted at a workspace directory
#[derive(Debug, Clone)]
pub struct JsonlSessionStore {
    /// Root path of the workspace
    workspace_root: PathBuf,
}

impl JsonlSessionStore {
    /// Create a store for a workspace
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    /// Get the workspace root path
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.workspace_root.join(".chatdesk").join("sessions")
    }

    /// Directory of one session. The id must be a single plain path segment
    /// so it cannot name anything outside the sessions directory.
    fn session_dir(&self, session_id: &str) -> ChatResult<PathBuf> {
        let mut components = Path::new(session_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == session_id => {
                Ok(self.sessions_dir().join(name))
            }
            _ => Err(ChatError::InvalidSessionId(session_id.to_string())),
        }
    }

    fn messages_path(&self, session_id: &str) -> ChatResult<PathBuf> {
        Ok(self.session_dir(session_id)?.join("messages.jsonl"))
    }

    /// Create a new session and persist it
    pub async fn create_session(&self, title: impl Into<String>) -> ChatResult<Session> {
        let session = Session::new(title);

        fs::create_dir_all(self.session_dir(&session.id)?).await?;
        self.write_session(&session).await?;
        fs::File::create(self.messages_path(&session.id)?).await?;

        debug!(session_id = %session.id, "Created session");
        Ok(session)
    }

    async fn write_session(&self, session: &Session) -> ChatResult<()> {
        let path = self.session_dir(&session.id)?.join("session.json");
        let content = serde_json::to_string_pretty(session)?;
        fs::write(path, content).await?;
        Ok(())
    }

    async fn read_revisions(&self, session_id: &str) -> ChatResult<Vec<Message>> {
        let path = self.messages_path(session_id)?;

        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path).await?;
        let mut revisions = Vec::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                revisions.push(serde_json::from_str(line)?);
            }
        }
        Ok(revisions)
    }

    /// List all sessions, most recently updated first
    pub async fn list_sessions(&self) -> ChatResult<Vec<Session>> {
        let dir = self.sessions_dir();

        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str() {
                if let Ok(session) = self.load_session(id).await {
                    sessions.push(session);
                }
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Delete a session and all its messages
    pub async fn delete_session(&self, session_id: &str) -> ChatResult<()> {
        let dir = self.session_dir(session_id)?;

        if !fs::try_exists(&dir).await? {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        }

        fs::remove_dir_all(dir).await?;
        Ok(())
    }

    /// Rewrite the message log with one line per message.
    ///
    /// Returns the number of revisions dropped.
    pub async fn compact_messages(&self, session_id: &str) -> ChatResult<usize> {
        let revisions = self.read_revisions(session_id).await?;
        let total = revisions.len();
        let messages = fold_revisions(revisions);

        let mut content = String::new();
        for message in &messages {
            content.push_str(&serde_json::to_string(message)?);
            content.push('\n');
        }

        let path = self.messages_path(session_id)?;
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(tmp, path).await?;

        Ok(total - messages.len())
    }
}

/// Collapse message revisions: last revision wins, first position kept
fn fold_revisions(revisions: Vec<Message>) -> Vec<Message> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut messages: Vec<Message> = Vec::new();

    for revision in revisions {
        match positions.get(&revision.id) {
            Some(&idx) => messages[idx] = revision,
            None => {
                positions.insert(revision.id.clone(), messages.len());
                messages.push(revision);
            }
        }
    }

    messages
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn load_session(&self, session_id: &str) -> ChatResult<Session> {
        let path = self.session_dir(session_id)?.join("session.json");

        if !fs::try_exists(&path).await? {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        }

        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn load_messages(&self, session_id: &str) -> ChatResult<Vec<Message>> {
        Ok(fold_revisions(self.read_revisions(session_id).await?))
    }

    async fn save_message(&self, message: &Message) -> ChatResult<Message> {
        let dir = self.session_dir(&message.session_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(ChatError::SessionNotFound(message.session_id.clone()));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.messages_path(&message.session_id)?)
            .await?;

        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(message.clone())
    }

    async fn update_session(&self, session_id: &str, patch: SessionPatch) -> ChatResult<Session> {
        let mut session = self.load_session(session_id).await?;
        session.apply(&patch);
        self.write_session(&session).await?;
        Ok(session)
    }
}
