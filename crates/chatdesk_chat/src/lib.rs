//! # chatdesk_chat - Streaming chat sessions
//!
//! This crate drives one conversation at a time against a streaming chat
//! backend:
//! - Send a message and receive the reply incrementally
//! - Stop a reply mid-stream, keeping what arrived as a partial message
//! - Continue a partial message in place
//! - Retry after a failure
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  open   ┌──────────────────┐
//! │   ChatSession   │────────▶│  StreamTransport │  HttpStreamTransport
//! │  (state machine)│◀────────│   StreamHandle   │  ScriptedTransport
//! └────────┬────────┘  events └──────────────────┘
//!          │ save / update
//!          ▼
//! ┌─────────────────┐
//! │  SessionStore   │  JsonlSessionStore, MemorySessionStore
//! └─────────────────┘
//! ```
//!
//! [`ChatManager`] tracks which session is active and tears down the
//! previous one on switch. Observers follow a session through
//! [`ChatSession::subscribe`].

pub mod config;
pub mod error;
pub mod http;
pub mod manager;
pub mod mock;
pub mod persistence;
pub mod session;
pub mod store;
pub mod streaming;
pub mod transport;
pub mod types;

pub use config::*;
pub use error::*;
pub use http::HttpStreamTransport;
pub use manager::ChatManager;
pub use persistence::JsonlSessionStore;
pub use session::*;
pub use store::SessionStore;
pub use streaming::{StreamPhase, StreamingView};
pub use transport::*;
pub use types::*;
