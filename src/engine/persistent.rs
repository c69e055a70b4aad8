//! Long-lived engine channel reused across turns.

use std::process::Stdio;
use std::sync::Arc;

use futures::stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::message::{interrupt_frame, parse_line, user_prompt_frame};
use super::{
    Connection, EngineConfig, EngineError, EngineResult, EventStream, InterruptOutcome,
    session_args,
};
use crate::config::SessionConfig;

type StdoutLines = Arc<Mutex<Lines<BufReader<ChildStdout>>>>;

/// Upper bound on flushing an interrupted turn's leftover events before the
/// next submit; a wedged engine must not block the session forever.
const DRAIN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// One engine process held open for the life of the session. Prompts go in
/// as stream-JSON frames on stdin; each query reads stdout until the
/// engine's terminal result message.
pub struct PersistentConnection {
    engine: EngineConfig,
    config: SessionConfig,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<StdoutLines>,
    request_seq: u64,
    /// An interrupted turn may leave its tail on the shared reader; flush it
    /// before the next prompt goes out.
    needs_drain: bool,
}

impl PersistentConnection {
    pub fn new(engine: EngineConfig, config: SessionConfig) -> Self {
        Self {
            engine,
            config,
            child: None,
            stdin: None,
            stdout: None,
            request_seq: 0,
            needs_drain: false,
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.engine.program);
        cmd.args(&self.engine.base_args)
            .arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .args(session_args(&self.config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn write_frame(&mut self, frame: &serde_json::Value) -> EngineResult<()> {
        let stdin = self.stdin.as_mut().ok_or(EngineError::NotConnected)?;
        let mut line = serde_json::to_vec(frame).map_err(|e| EngineError::Protocol {
            message: e.to_string(),
        })?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Discard events up to the aborted turn's terminal result message.
    async fn drain_stale(&mut self) {
        let Some(lines) = self.stdout.clone() else {
            return;
        };
        let drain = async move {
            let mut lines = lines.lock().await;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(msg) = parse_line(&line) {
                    if msg.is_terminal() {
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            warn!("stale engine events did not drain within grace period");
        }
    }
}

#[async_trait::async_trait]
impl Connection for PersistentConnection {
    async fn connect(&mut self) -> EngineResult<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let mut child =
            self.build_command()
                .spawn()
                .map_err(|e| EngineError::ConnectionFailed {
                    message: format!("spawn {}: {}", self.engine.program.display(), e),
                })?;
        let stdin = child.stdin.take().ok_or(EngineError::ConnectionFailed {
            message: "engine stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or(EngineError::ConnectionFailed {
            message: "engine stdout unavailable".into(),
        })?;
        debug!(program = %self.engine.program.display(), "engine process started");
        self.stdin = Some(stdin);
        self.stdout = Some(Arc::new(Mutex::new(BufReader::new(stdout).lines())));
        self.child = Some(child);
        Ok(())
    }

    async fn submit(&mut self, prompt: &str) -> EngineResult<EventStream> {
        if self.stdout.is_none() {
            return Err(EngineError::NotConnected);
        }
        if self.needs_drain {
            self.drain_stale().await;
            self.needs_drain = false;
        }
        let lines = self.stdout.clone().ok_or(EngineError::NotConnected)?;
        self.write_frame(&user_prompt_frame(prompt)).await?;

        // Reads until the engine's terminal result message; the reader handle
        // is shared so the next query resumes on the same channel.
        let events = stream::unfold((lines, false), |(lines, done)| async move {
            if done {
                return None;
            }
            loop {
                let next = lines.lock().await.next_line().await;
                return match next {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(msg) => {
                            let terminal = msg.is_terminal();
                            Some((Ok(msg), (lines, terminal)))
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable engine line");
                            let err = EngineError::Protocol {
                                message: e.to_string(),
                            };
                            Some((Err(err), (lines, false)))
                        }
                    },
                    Ok(None) => Some((Err(EngineError::ChannelClosed), (lines, true))),
                    Err(e) => Some((Err(EngineError::Io(e)), (lines, true))),
                };
            }
        });
        Ok(Box::pin(events))
    }

    async fn interrupt(&mut self) -> EngineResult<InterruptOutcome> {
        self.request_seq += 1;
        let frame = interrupt_frame(&format!("req_{}", self.request_seq));
        match self.write_frame(&frame).await {
            Ok(()) => {
                self.needs_drain = true;
                Ok(InterruptOutcome::Acknowledged)
            }
            Err(e) => {
                // Channel unusable for control traffic; fall back to teardown.
                warn!(error = %e, "interrupt request failed, killing engine process");
                self.disconnect().await;
                Ok(InterruptOutcome::Disconnected)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.stdin = None;
        self.stdout = None;
        self.needs_drain = false;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "engine process already gone");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConnectionMode;

    fn test_connection() -> PersistentConnection {
        let engine = EngineConfig {
            program: "/nonexistent/engine-binary".into(),
            base_args: Vec::new(),
            mode: ConnectionMode::Persistent,
        };
        PersistentConnection::new(engine, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_failed() {
        let mut conn = test_connection();
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailed { .. }));
        assert!(!conn.is_connected());
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
    async fn test_disconnect_is_idempotent() {
        let mut conn = test_connection();
        conn.disconnect().await;
        conn.disconnect().await;
        assert!(!conn.is_connected());
    }
}
