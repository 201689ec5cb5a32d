//! Chat command - Interactive streaming chat.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use chatdesk_chat::{
    ChatError, ChatManager, ChatSession, HttpStreamTransport, JsonlSessionStore, MessageRole,
    SessionEvent, Settings,
};

#[derive(Args)]
pub struct ChatArgs {
    /// Session to resume (a new one is created when omitted)
    #[arg(short, long)]
    pub session: Option<String>,

    /// Personality for replies (defaults to the session's last used)
    #[arg(short, long)]
    pub personality: Option<String>,

    /// AI provider for replies (defaults to the session's last used)
    #[arg(long)]
    pub provider: Option<String>,
}

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Stop,
    Continue,
    Retry,
    Switch(String),
    New,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_command(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Send(line.to_string());
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

    match (name, arg) {
        ("stop", None) => ReplCommand::Stop,
        ("continue", None) => ReplCommand::Continue,
        ("retry", None) => ReplCommand::Retry,
        ("switch", Some(id)) => ReplCommand::Switch(id.to_string()),
        ("new", None) => ReplCommand::New,
        ("help", None) => ReplCommand::Help,
        ("quit", None) | ("exit", None) => ReplCommand::Quit,
        _ => ReplCommand::Unknown(line.to_string()),
    }
}

enum Input {
    Event(Option<SessionEvent>),
    Line(Option<String>),
    Interrupt,
}

struct Repl {
    manager: ChatManager,
    store: JsonlSessionStore,
    default_title: String,
    personality: Option<String>,
    provider: Option<String>,
}

pub async fn execute(args: ChatArgs, workspace: &Path) -> Result<()> {
    let settings = Settings::from_settings(workspace)?;
    let store = JsonlSessionStore::new(workspace);

    let session_id = match args.session {
        Some(id) => id,
        None => store.create_session(&settings.chat.default_title).await?.id,
    };

    info!(session_id = %session_id, backend = %settings.transport.stream_url(), "Starting chat");

    let transport = HttpStreamTransport::new(settings.transport.clone());
    let mut repl = Repl {
        manager: ChatManager::new(
            Arc::new(transport),
            Arc::new(store.clone()),
            settings.chat.clone(),
        ),
        store,
        default_title: settings.chat.default_title.clone(),
        personality: args.personality,
        provider: args.provider,
    };
    repl.switch(&session_id).await?;

    println!("Type a message, or /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Some(chat) = repl.manager.active_mut() else {
            break;
        };

        let input = if chat.is_streaming() {
            tokio::select! {
                event = chat.next_event() => Input::Event(event),
                line = lines.next_line() => Input::Line(line?),
                _ = tokio::signal::ctrl_c() => Input::Interrupt,
            }
        } else {
            prompt();
            Input::Line(lines.next_line().await?)
        };

        match input {
            Input::Event(Some(event)) => render_event(&event),
            Input::Event(None) => {}
            Input::Interrupt => repl.stop().await,
            Input::Line(None) => break,
            Input::Line(Some(line)) => {
                if !repl.handle(parse_command(&line)).await? {
                    break;
                }
            }
        }
    }

    repl.manager.close_active().await;
    Ok(())
}

impl Repl {
    fn chat(&mut self) -> Result<&mut ChatSession> {
        self.manager
            .active_mut()
            .context("No active session")
    }

    /// Apply one command; false ends the REPL
    async fn handle(&mut self, command: ReplCommand) -> Result<bool> {
        match command {
            ReplCommand::Empty => {}
            ReplCommand::Quit => return Ok(false),
            ReplCommand::Help => print_help(),
            ReplCommand::Unknown(line) => println!("Unknown command: {} (try /help)", line),
            ReplCommand::Stop => self.stop().await,
            ReplCommand::Send(content) => {
                let (personality, provider) = (self.personality.clone(), self.provider.clone());
                let chat = self.chat()?;
                report(chat.send(&content, personality, provider).await)?;
            }
            ReplCommand::Continue => {
                let chat = self.chat()?;
                match chat.last_partial().map(|m| m.id.clone()) {
                    Some(id) => report(chat.continue_from(&id).await)?,
                    None => println!("Nothing to continue."),
                }
            }
            ReplCommand::Retry => {
                let chat = self.chat()?;
                report(chat.retry_last().await)?;
            }
            ReplCommand::Switch(id) => report(self.switch(&id).await)?,
            ReplCommand::New => {
                let session = self.store.create_session(&self.default_title).await?;
                report(self.switch(&session.id).await)?;
            }
        }
        Ok(true)
    }

    async fn stop(&mut self) {
        if let Some(chat) = self.manager.active_mut() {
            if chat.stop().await.is_some() {
                println!();
                println!("[stopped - /continue to resume]");
            }
        }
    }

    async fn switch(&mut self, session_id: &str) -> chatdesk_chat::ChatResult<()> {
        let chat = self.manager.switch_to(session_id).await?;
        let session = chat.session();

        if self.personality.is_none() {
            self.personality = session.last_used_personality_id.clone();
        }
        if self.provider.is_none() {
            self.provider = session.last_used_provider_id.clone();
        }

        println!("── {} ({}) ──", session.title, session.id);
        for message in chat.messages() {
            let who = match message.role {
                MessageRole::User => "you",
                MessageRole::Assistant => "assistant",
            };
            let marker = if message.is_partial { " [partial]" } else { "" };
            println!("{}{}: {}", who, marker, message.content);
        }
        Ok(())
    }
}

/// Print recoverable chat errors and keep going; anything else is fatal
fn report(result: chatdesk_chat::ChatResult<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e @ ChatError::Busy(_))
        | Err(e @ ChatError::EmptyContent)
        | Err(e @ ChatError::MessageNotFound(_))
        | Err(e @ ChatError::NotPartial(_))
        | Err(e @ ChatError::SessionNotFound(_))
        | Err(e @ ChatError::InvalidSessionId(_)) => {
            println!("{}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn render_event(event: &SessionEvent) {
    match event {
        SessionEvent::Chunk(text) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
        SessionEvent::Completed(_) => println!(),
        SessionEvent::Failed(error) => {
            println!();
            println!("[error: {} - /retry to try again]", error);
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    println!("Commands:");
    println!("  /stop          Stop the reply, keeping what arrived");
    println!("  /continue      Continue the last partial reply");
    println!("  /retry         Resend the last message");
    println!("  /switch <id>   Switch to another session");
    println!("  /new           Start a new session");
    println!("  /quit          Leave (Ctrl-D works too)");
    println!("Ctrl-C stops a streaming reply.");
}
