//! Session lifecycle and streaming orchestration.
//!
//! A session is one addressable multi-turn conversation with the upstream
//! engine. The [`SessionRegistry`] owns every live session; each
//! [`SessionHandle`] owns one connection, serializes its queries, and keeps
//! lifetime usage counters.

pub mod handle;
pub mod ids;
pub mod registry;
pub mod state;
pub mod turn;
pub mod usage;

pub use handle::{SessionHandle, SessionSnapshot};
pub use ids::SessionId;
pub use registry::SessionRegistry;
pub use state::ConnectionState;
pub use turn::QueryStream;
pub use usage::UsageTotals;

use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Session busy with another query: {id}")]
    Busy { id: String },

    #[error("Invalid session config: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine connection error: {0}")]
    Connection(#[from] EngineError),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted in-memory engine for unit tests.

    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::config::SessionConfig;
    use crate::engine::{
        Connection, ConnectionFactory, EngineError, EngineMessage, EngineResult, EventStream,
        InterruptOutcome,
    };

    pub(crate) struct StubConnection {
        connected: bool,
        script: Vec<EngineMessage>,
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn connect(&mut self) -> EngineResult<()> {
            self.connected = true;
            Ok(())
        }

        async fn submit(&mut self, _prompt: &str) -> EngineResult<EventStream> {
            if !self.connected {
                return Err(EngineError::NotConnected);
            }
            let events = self.script.clone();
            Ok(Box::pin(futures::stream::iter(
                events.into_iter().map(Ok::<_, EngineError>),
            )))
        }

        async fn interrupt(&mut self) -> EngineResult<InterruptOutcome> {
            Ok(InterruptOutcome::Acknowledged)
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    pub(crate) struct StubFactory {
        script: Vec<EngineMessage>,
    }

    impl StubFactory {
        pub(crate) fn idle() -> Arc<Self> {
            Arc::new(Self { script: Vec::new() })
        }

        pub(crate) fn scripted(script: Vec<EngineMessage>) -> Arc<Self> {
            Arc::new(Self { script })
        }
    }

    impl ConnectionFactory for StubFactory {
        fn open(&self, _config: &SessionConfig) -> Box<dyn Connection> {
            Box::new(StubConnection {
                connected: false,
                script: self.script.clone(),
            })
        }
    }
}
