//! Connection abstraction over the upstream AI engine.
//!
//! The engine is reached through a child process speaking line-delimited
//! stream-JSON. Two interchangeable strategies exist: a persistent process
//! reused across turns ([`PersistentConnection`]) and a one-shot process per
//! query ([`EphemeralConnection`]). Session logic never branches on the
//! strategy; both live behind the [`Connection`] trait.

pub mod backoff;
pub mod ephemeral;
pub mod message;
pub mod persistent;

pub use backoff::ConnectRetry;
pub use ephemeral::EphemeralConnection;
pub use message::{ContentBlock, EngineMessage, MessagePayload, UsageInfo};
pub use persistent::PersistentConnection;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::config::SessionConfig;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to reach engine: {message}")]
    ConnectionFailed { message: String },

    #[error("Engine channel is not connected")]
    NotConnected,

    #[error("Engine protocol violation: {message}")]
    Protocol { message: String },

    #[error("Engine channel closed unexpectedly")]
    ChannelClosed,

    #[error("Engine I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this failure corrupts the channel itself, as opposed to a
    /// single bad message that the stream can skip over.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::Protocol { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Lazy sequence of engine-native events for one submitted query.
///
/// Owned by the caller: it does not borrow the connection, so the session can
/// keep issuing control operations (interrupt, disconnect) while the stream
/// is being consumed.
pub type EventStream = Pin<Box<dyn Stream<Item = EngineResult<EngineMessage>> + Send>>;

/// How an interrupt request was resolved by the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// The engine acknowledged cancellation; the channel remains usable.
    Acknowledged,
    /// Cancellation required tearing the channel down.
    Disconnected,
}

/// A single logical channel to the upstream engine.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish the channel. Retried with backoff by the owning session.
    async fn connect(&mut self) -> EngineResult<()>;

    /// Submit a prompt and return its event stream.
    ///
    /// Engine channels are single-stream; the owning session guarantees no
    /// prior submission's stream is still open when this is called.
    async fn submit(&mut self, prompt: &str) -> EngineResult<EventStream>;

    /// Best-effort mid-stream cancellation.
    async fn interrupt(&mut self) -> EngineResult<InterruptOutcome>;

    /// Tear the channel down. Idempotent; never errors when already down.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Which connection strategy a session uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Persistent,
    Ephemeral,
}

/// Engine process configuration shared by every session.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Engine binary to spawn.
    pub program: PathBuf,
    /// Arguments prepended before per-session flags.
    pub base_args: Vec<String>,
    pub mode: ConnectionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("claude"),
            base_args: Vec::new(),
            mode: ConnectionMode::Persistent,
        }
    }
}

/// Builds connections for sessions. Injected into the registry so tests can
/// substitute a scripted engine.
pub trait ConnectionFactory: Send + Sync {
    fn open(&self, config: &SessionConfig) -> Box<dyn Connection>;
}

/// Factory producing real subprocess-backed connections.
pub struct ProcessConnectionFactory {
    engine: EngineConfig,
}

impl ProcessConnectionFactory {
    pub fn new(engine: EngineConfig) -> Arc<Self> {
        Arc::new(Self { engine })
    }
}

impl ConnectionFactory for ProcessConnectionFactory {
    fn open(&self, config: &SessionConfig) -> Box<dyn Connection> {
        match self.engine.mode {
            ConnectionMode::Persistent => {
                Box::new(PersistentConnection::new(self.engine.clone(), config.clone()))
            }
            ConnectionMode::Ephemeral => {
                Box::new(EphemeralConnection::new(self.engine.clone(), config.clone()))
            }
        }
    }
}

/// Translate a session config into engine CLI flags.
///
/// Shared by both connection strategies so a config swap produces identical
/// engine behavior regardless of mode.
pub(crate) fn session_args(config: &SessionConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(prompt) = &config.system_prompt {
        args.push("--system-prompt".to_string());
        args.push(prompt.clone());
    }
    if !config.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(config.allowed_tools.join(","));
    }
    if let Some(max_turns) = config.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }
    args.push("--permission-mode".to_string());
    args.push(config.permission_mode.as_engine_arg().to_string());
    args
}
