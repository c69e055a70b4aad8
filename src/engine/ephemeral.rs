//! One-shot engine process per query.

use std::process::Stdio;
use std::sync::Arc;

use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::message::parse_line;
use super::{
    Connection, EngineConfig, EngineError, EngineResult, EventStream, InterruptOutcome,
    session_args,
};
use crate::config::SessionConfig;

/// Spawns a fresh engine process for every query and streams its stdout to
/// EOF. There is no standing channel to lose, so "connected" only means the
/// strategy is armed; interruption kills the in-flight child and leaves the
/// connection usable.
pub struct EphemeralConnection {
    engine: EngineConfig,
    config: SessionConfig,
    connected: bool,
    current: Arc<Mutex<Option<Child>>>,
}

impl EphemeralConnection {
    pub fn new(engine: EngineConfig, config: SessionConfig) -> Self {
        Self {
            engine,
            config,
            connected: false,
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn build_command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.engine.program);
        cmd.args(&self.engine.base_args)
            .arg("--print")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .args(session_args(&self.config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait::async_trait]
impl Connection for EphemeralConnection {
    async fn connect(&mut self) -> EngineResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn submit(&mut self, prompt: &str) -> EngineResult<EventStream> {
        if !self.connected {
            return Err(EngineError::NotConnected);
        }
        let mut child =
            self.build_command(prompt)
                .spawn()
                .map_err(|e| EngineError::ConnectionFailed {
                    message: format!("spawn {}: {}", self.engine.program.display(), e),
                })?;
        let stdout = child.stdout.take().ok_or(EngineError::ConnectionFailed {
            message: "engine stdout unavailable".into(),
        })?;
        debug!(program = %self.engine.program.display(), "one-shot engine process started");

        *self.current.lock().await = Some(child);
        let slot = Arc::clone(&self.current);

        let events = stream::unfold(
            (BufReader::new(stdout).lines(), slot, false),
            |(mut lines, slot, done)| async move {
                if done {
                    return None;
                }
                loop {
                    return match lines.next_line().await {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match parse_line(&line) {
                            Ok(msg) => Some((Ok(msg), (lines, slot, false))),
                            Err(e) => {
                                warn!(error = %e, "unparseable engine line");
                                let err = EngineError::Protocol {
                                    message: e.to_string(),
                                };
                                Some((Err(err), (lines, slot, false)))
                            }
                        },
                        // EOF ends the query; reap the child so it does not
                        // linger as a zombie.
                        Ok(None) => {
                            if let Some(mut child) = slot.lock().await.take() {
                                let _ = child.wait().await;
                            }
                            None
                        }
                        Err(e) => Some((Err(EngineError::Io(e)), (lines, slot, true))),
                    };
                }
            },
        );
        Ok(Box::pin(events))
    }

    async fn interrupt(&mut self) -> EngineResult<InterruptOutcome> {
        if let Some(child) = self.current.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "in-flight engine process already gone");
            }
        }
        // The per-query process is gone but the strategy itself is unharmed.
        Ok(InterruptOutcome::Acknowledged)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
        if let Some(mut child) = self.current.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "engine process already gone");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConnectionMode;

    fn test_connection() -> EphemeralConnection {
        let engine = EngineConfig {
            program: "/nonexistent/engine-binary".into(),
            base_args: Vec::new(),
            mode: ConnectionMode::Ephemeral,
        };
        EphemeralConnection::new(engine, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_connect_always_succeeds() {
        let mut conn = test_connection();
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_submit_without_connect_rejected() {
        let mut conn = test_connection();
        let err = match conn.submit("hello").await {
            Ok(_) => panic!("called `Result::unwrap_err()` on an `Ok` value"),
            Err(e) => e,
        };
        assert!(matches!(err, EngineError::NotConnected));
    }

    #[tokio::test]
    async fn test_submit_spawn_failure_is_connection_failed() {
        let mut conn = test_connection();
        conn.connect().await.unwrap();
        let err = match conn.submit("hello").await {
            Ok(_) => panic!("called `Result::unwrap_err()` on an `Ok` value"),
            Err(e) => e,
        };
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_interrupt_with_no_query_is_acknowledged() {
        let mut conn = test_connection();
        conn.connect().await.unwrap();
        let outcome = conn.interrupt().await.unwrap();
        assert_eq!(outcome, InterruptOutcome::Acknowledged);
        assert!(conn.is_connected());
    }
}
