//! History command - Print the messages of a session.

use std::path::Path;

use anyhow::Result;
use clap::Args;

use chatdesk_chat::{JsonlSessionStore, Message, MessageRole, SessionStore};

#[derive(Args)]
pub struct HistoryArgs {
    /// Session to print
    pub session: String,

    /// Print messages as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: HistoryArgs, workspace: &Path) -> Result<()> {
    let store = JsonlSessionStore::new(workspace);
    let session = store.load_session(&args.session).await?;
    let messages = store.load_messages(&args.session).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    println!("{} ({})", session.title, session.id);
    println!();
    for message in &messages {
        println!("{}", format_message(message));
    }

    Ok(())
}

fn format_message(message: &Message) -> String {
    let who = match message.role {
        MessageRole::User => "you".to_string(),
        MessageRole::Assistant => match message.personality_id {
            Some(ref personality) => personality.clone(),
            None => "assistant".to_string(),
        },
    };
    let partial = if message.is_partial { " (partial)" } else { "" };
    format!(
        "[{}] {}{}: {}",
        message.created_at.format("%H:%M"),
        who,
        partial,
        message.content
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_message() {
        let user = Message::user("s1", "Explain recursion");
        assert!(format_message(&user).ends_with("you: Explain recursion"));

        let reply = Message::assistant("s1", "Recursion is")
            .with_provenance(Some("tutor".to_string()), None)
            .partial();
        assert!(format_message(&reply).ends_with("tutor (partial): Recursion is"));
    }
}
