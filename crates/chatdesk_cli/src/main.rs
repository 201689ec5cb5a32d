//! chatdesk CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Session or message not found
//! - 4: Configuration error
//! - 5: Backend unreachable

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use chatdesk_chat::ChatError;

mod commands;

use commands::{Cli, Commands};

/// Script-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const NOT_FOUND: u8 = 3;
    pub const CONFIG_ERROR: u8 = 4;
    pub const TRANSPORT_ERROR: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let workspace = match cli.workspace_root() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(ExitCodes::INVALID_ARGS);
        }
    };

    let result = match cli.command {
        Commands::Chat(args) => commands::chat::execute(args, &workspace).await,
        Commands::Sessions(args) => commands::sessions::execute(args, &workspace).await,
        Commands::History(args) => commands::history::execute(args, &workspace).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(categorize_error(&e))
        }
    }
}

fn log_filter(cli: &Cli) -> EnvFilter {
    let default_level = if cli.verbose {
        "chatdesk=debug"
    } else if cli.quiet {
        "chatdesk=error"
    } else {
        "chatdesk=info"
    };

    let filter = EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into());
    match default_level.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Install the global subscriber; a second call leaves the first in place
fn init_logging(cli: &Cli) {
    let filter = log_filter(cli);

    // Log lines go to stderr so streamed replies stay clean on stdout
    let _ = if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    };
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<ChatError>() {
        Some(ChatError::SessionNotFound(_)) | Some(ChatError::MessageNotFound(_)) => {
            ExitCodes::NOT_FOUND
        }
        Some(ChatError::Config(_)) => ExitCodes::CONFIG_ERROR,
        Some(ChatError::Transport(_)) => ExitCodes::TRANSPORT_ERROR,
        Some(err) if err.is_validation() => ExitCodes::INVALID_ARGS,
        _ => ExitCodes::GENERAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_levels() {
        let cli = Cli::parse_from(["chatdesk", "--verbose", "sessions"]);
        assert!(log_filter(&cli).to_string().contains("chatdesk=debug"));

        let cli = Cli::parse_from(["chatdesk", "--quiet", "sessions"]);
        assert!(log_filter(&cli).to_string().contains("chatdesk=error"));
    }

    #[test]
    fn test_logging_init_twice_is_harmless() {
        let cli = Cli::parse_from(["chatdesk", "--log-json", "sessions"]);
        init_logging(&cli);
        init_logging(&cli);
    }

    #[test]
    fn test_categorize_error() {
        let code = |e: ChatError| categorize_error(&anyhow::Error::from(e));
        assert_eq!(code(ChatError::SessionNotFound("x".to_string())), ExitCodes::NOT_FOUND);
        assert_eq!(code(ChatError::InvalidSessionId("..".to_string())), ExitCodes::INVALID_ARGS);
        assert_eq!(code(ChatError::Transport("down".to_string())), ExitCodes::TRANSPORT_ERROR);
        assert_eq!(code(ChatError::Config("bad".to_string())), ExitCodes::CONFIG_ERROR);
        assert_eq!(
            categorize_error(&anyhow::anyhow!("something else")),
            ExitCodes::GENERAL_ERROR
        );
    }
}
