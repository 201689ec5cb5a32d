//! CLI command definitions.
//!
//! Each subcommand works on the sessions stored in one workspace
//! directory (`.chatdesk/` under the workspace root).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

pub mod chat;
pub mod history;
pub mod sessions;

/// chatdesk - streaming chat in the terminal
#[derive(Parser)]
#[command(name = "chatdesk")]
#[command(version, about = "chatdesk - streaming chat in the terminal")]
#[command(long_about = r#"
chatdesk talks to a streaming chat backend and keeps every conversation
on disk. Replies arrive incrementally and can be stopped, continued or
retried.

COMMANDS:
  chat      → Open a session (new or existing) and chat interactively
  sessions  → List, delete or compact stored sessions
  history   → Print the messages of a session

CONFIGURATION:
  .chatdesk/settings.json in the workspace, overridden by
  CHATDESK_API_URL, CHATDESK_API_KEY and CHATDESK_USER_ID.

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Session or message not found
  4 - Configuration error
  5 - Backend unreachable
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace holding `.chatdesk/` (defaults to current directory)
    #[arg(short, long, global = true, env = "CHATDESK_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn workspace_root(&self) -> Result<PathBuf> {
        match self.workspace {
            Some(ref path) => Ok(path.clone()),
            None => std::env::current_dir().context("Failed to resolve current directory"),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat interactively in a new or existing session
    Chat(chat::ChatArgs),

    /// List and maintain stored sessions
    Sessions(sessions::SessionsArgs),

    /// Print the messages of a session
    History(history::HistoryArgs),
}
