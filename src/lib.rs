//! # claude-sessions
//!
//! Session orchestration core for streaming Claude conversations.
//!
//! This crate manages many concurrent conversations with the Claude Code
//! engine: a registry of addressable sessions, a connection abstraction over
//! the engine channel (persistent or one-shot-per-query subprocess), a
//! normalized event stream with a guaranteed terminal `Done`, cooperative
//! interrupts, and per-session usage accounting. Transport layers (HTTP,
//! SSE, websockets) sit on top and relay events verbatim.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use claude_sessions::{EngineConfig, SessionRegistry, StreamEvent};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), claude_sessions::SessionError> {
//!     let registry = SessionRegistry::with_engine(EngineConfig::default());
//!     let session = registry.create(None, None)?;
//!
//!     let mut events = session.send("What is 2 + 2?")?;
//!     while let Some(event) = events.next().await {
//!         match event {
//!             StreamEvent::AssistantText { text } => print!("{}", text),
//!             StreamEvent::Result { cost_usd, .. } => {
//!                 println!("\n(${:.4})", cost_usd);
//!             }
//!             StreamEvent::Done => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod engine;
pub mod session;
pub mod stream;

pub use config::{ConfigError, PermissionMode, SessionConfig, TOOL_WHITELIST};
pub use engine::{
    ConnectRetry, Connection, ConnectionFactory, ConnectionMode, EngineConfig, EngineError,
    EngineMessage, EngineResult, EphemeralConnection, EventStream, InterruptOutcome,
    PersistentConnection, ProcessConnectionFactory,
};
pub use session::{
    ConnectionState, QueryStream, SessionError, SessionHandle, SessionId, SessionRegistry,
    SessionResult, SessionSnapshot, UsageTotals,
};
pub use stream::{Normalized, StreamEvent, normalize, normalize_error};
