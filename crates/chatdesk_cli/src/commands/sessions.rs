//! Sessions command - List and maintain stored sessions.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use tracing::info;

use chatdesk_chat::{JsonlSessionStore, Session};

#[derive(Args)]
pub struct SessionsArgs {
    /// Delete a session and its messages
    #[arg(long, value_name = "ID", conflicts_with = "compact")]
    pub delete: Option<String>,

    /// Rewrite a session's message log, dropping superseded revisions
    #[arg(long, value_name = "ID")]
    pub compact: Option<String>,

    /// Print sessions as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: SessionsArgs, workspace: &Path) -> Result<()> {
    let store = JsonlSessionStore::new(workspace);

    if let Some(id) = args.delete {
        store.delete_session(&id).await?;
        info!(session_id = %id, "Deleted session");
        println!("Deleted session {}", id);
        return Ok(());
    }

    if let Some(id) = args.compact {
        let dropped = store.compact_messages(&id).await?;
        println!("Compacted session {} ({} revisions dropped)", id, dropped);
        return Ok(());
    }

    let sessions = store.list_sessions().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else if sessions.is_empty() {
        println!("No sessions yet. Start one with: chatdesk chat");
    } else {
        for session in &sessions {
            println!("{}", format_row(session));
        }
    }

    Ok(())
}

fn format_row(session: &Session) -> String {
    let settings = match (&session.last_used_personality_id, &session.last_used_provider_id) {
        (Some(personality), Some(provider)) => format!("  [{} via {}]", personality, provider),
        (Some(personality), None) => format!("  [{}]", personality),
        (None, Some(provider)) => format!("  [via {}]", provider),
        (None, None) => String::new(),
    };
    format!(
        "{}  {}  {}{}",
        session.id,
        session.updated_at.format("%Y-%m-%d %H:%M"),
        session.title,
        settings
    )
}
