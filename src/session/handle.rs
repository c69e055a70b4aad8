//! Per-session orchestrator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ids::SessionId;
use super::state::{ConnectionState, StateCell};
use super::turn::QueryStream;
use super::usage::UsageTotals;
use super::{SessionError, SessionResult};
use crate::config::{ConfigError, SessionConfig};
use crate::engine::{
    ConnectRetry, Connection, ConnectionFactory, EngineError, EngineResult, EventStream,
    InterruptOutcome,
};

/// Cheaply cloneable handle to one session.
///
/// The registry holds the owning reference; clones handed to callers become
/// inert once the session is destroyed (operations fail with `NotFound`).
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a session's observable state. Never blocks an
/// in-flight query.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub connection_state: ConnectionState,
    /// Whether a query is currently in flight.
    pub active: bool,
    pub config: SessionConfig,
    pub message_count: u64,
    pub usage: UsageTotals,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    factory: Arc<dyn ConnectionFactory>,
    retry: ConnectRetry,
    config: StdRwLock<SessionConfig>,
    /// The engine channel. `None` until the first query provisions it, and
    /// again after a teardown; mutated only under this lock.
    connection: Mutex<Option<Box<dyn Connection>>>,
    pub(crate) state: StateCell,
    stats: StdMutex<UsageTotals>,
    message_count: AtomicU64,
    created_at: DateTime<Utc>,
    last_activity_at: StdMutex<DateTime<Utc>>,
    /// One permit: the at-most-one-in-flight-query invariant.
    query_gate: Arc<Semaphore>,
    /// Cancelled exactly once, at destruction; query tokens are children.
    lifetime: CancellationToken,
    query_cancel: StdMutex<Option<CancellationToken>>,
    /// Set by a config swap or an abandoned turn: rebuild the connection
    /// before the next query.
    pub(crate) reprovision: AtomicBool,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        config: SessionConfig,
        factory: Arc<dyn ConnectionFactory>,
        retry: ConnectRetry,
    ) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id,
                factory,
                retry,
                config: StdRwLock::new(config),
                connection: Mutex::new(None),
                state: StateCell::new(ConnectionState::Disconnected),
                stats: StdMutex::new(UsageTotals::default()),
                message_count: AtomicU64::new(0),
                created_at: now,
                last_activity_at: StdMutex::new(now),
                query_gate: Arc::new(Semaphore::new(1)),
                lifetime: CancellationToken::new(),
                query_cancel: StdMutex::new(None),
                reprovision: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Start a query. Returns a lazy, finite, non-restartable event stream
    /// ending in exactly one `Done`.
    ///
    /// A concurrent query on the same session is rejected with
    /// [`SessionError::Busy`] rather than queued; silent queueing would hide
    /// latency from the caller.
    pub fn send(&self, prompt: impl Into<String>) -> SessionResult<QueryStream> {
        let inner = &self.inner;
        if inner.lifetime.is_cancelled() {
            return Err(SessionError::NotFound {
                id: inner.id.to_string(),
            });
        }
        let permit = inner
            .query_gate
            .clone()
            .try_acquire_owned()
            .map_err(|_| SessionError::Busy {
                id: inner.id.to_string(),
            })?;

        let cancel = inner.lifetime.child_token();
        *inner.query_cancel.lock().unwrap() = Some(cancel.clone());
        let timeout = inner
            .config
            .read()
            .unwrap()
            .timeout_seconds
            .map(Duration::from_secs);
        inner.message_count.fetch_add(1, Ordering::Relaxed);
        inner.touch();
        debug!(session_id = %inner.id, "query accepted");

        Ok(QueryStream::new(
            Arc::clone(inner),
            permit,
            cancel,
            prompt.into(),
            timeout,
        ))
    }

    /// Cooperatively cancel the in-flight query.
    ///
    /// Returns `false` when nothing is in flight, including the race where
    /// the query completed just before the interrupt landed. That race is
    /// decided by the state cell's CAS, never by a flag.
    pub async fn interrupt(&self) -> bool {
        let inner = &self.inner;
        if !inner
            .state
            .transition(ConnectionState::Busy, ConnectionState::Interrupting)
        {
            return false;
        }
        debug!(session_id = %inner.id, "interrupting in-flight query");
        if let Some(token) = inner.query_cancel.lock().unwrap().take() {
            token.cancel();
        }
        inner.settle_interrupt().await;
        true
    }

    /// Reset per-conversation transient state. Lifetime usage counters are
    /// deliberately kept.
    pub fn clear(&self) {
        self.inner.message_count.store(0, Ordering::Relaxed);
        self.inner.touch();
        debug!(session_id = %self.inner.id, "session context cleared");
    }

    /// Replace the session config. The connection is re-provisioned lazily
    /// on the next query; counters and message_count survive the swap.
    pub fn update_config(&self, config: SessionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.config.write().unwrap() = config;
        self.inner.reprovision.store(true, Ordering::Release);
        debug!(session_id = %self.inner.id, "session config replaced");
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = &self.inner;
        let state = inner.state.load();
        SessionSnapshot {
            session_id: inner.id.clone(),
            connection_state: state,
            active: state.is_active(),
            config: inner.config.read().unwrap().clone(),
            message_count: inner.message_count.load(Ordering::Relaxed),
            usage: *inner.stats.lock().unwrap(),
            created_at: inner.created_at,
            last_activity_at: *inner.last_activity_at.lock().unwrap(),
        }
    }

    /// Cancel the in-flight query, tear the connection down, and leave the
    /// handle inert. Called by the registry before removing its entry.
    pub(crate) async fn shutdown(&self) {
        let inner = &self.inner;
        inner.lifetime.cancel();
        if let Some(token) = inner.query_cancel.lock().unwrap().take() {
            token.cancel();
        }
        let mut slot = inner.connection.lock().await;
        if let Some(mut conn) = slot.take() {
            conn.disconnect().await;
        }
        inner.state.force_disconnected();
    }
}

impl SessionInner {
    pub(crate) fn touch(&self) {
        *self.last_activity_at.lock().unwrap() = Utc::now();
    }

    pub(crate) fn apply_result(&self, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        self.stats
            .lock()
            .unwrap()
            .apply(input_tokens, output_tokens, cost_usd);
    }

    pub(crate) fn clear_query_cancel(&self) {
        self.query_cancel.lock().unwrap().take();
    }

    /// Ensure a connected channel (provisioning or re-provisioning as
    /// needed), move to Busy, and submit the prompt.
    pub(crate) async fn establish_and_submit(&self, prompt: &str) -> EngineResult<EventStream> {
        let mut slot = self.connection.lock().await;

        if self.reprovision.swap(false, Ordering::AcqRel) {
            if let Some(mut old) = slot.take() {
                debug!(session_id = %self.id, "re-provisioning engine connection");
                old.disconnect().await;
            }
            self.state.force_disconnected();
        }
        if slot.is_none() {
            let config = self.config.read().unwrap().clone();
            *slot = Some(self.factory.open(&config));
        }
        let conn = slot.as_mut().expect("connection just provisioned");

        if !conn.is_connected() {
            self.state
                .transition(ConnectionState::Disconnected, ConnectionState::Connecting);
            match self.retry.connect(conn).await {
                Ok(()) => {
                    self.state
                        .transition(ConnectionState::Connecting, ConnectionState::Connected);
                }
                Err(e) => {
                    self.state.force_disconnected();
                    return Err(e);
                }
            }
        }

        if !self
            .state
            .transition(ConnectionState::Connected, ConnectionState::Busy)
        {
            // Torn down underneath us between connect and submit.
            return Err(EngineError::NotConnected);
        }

        match conn.submit(prompt).await {
            Ok(events) => Ok(events),
            Err(e) => {
                if e.is_fatal() {
                    if let Some(mut dead) = slot.take() {
                        dead.disconnect().await;
                    }
                    self.state.force_disconnected();
                } else {
                    self.state
                        .transition(ConnectionState::Busy, ConnectionState::Connected);
                }
                Err(e)
            }
        }
    }

    /// Resolve an interrupt against the channel and settle the state machine
    /// per the outcome. State is already `Interrupting` when this runs.
    pub(crate) async fn settle_interrupt(&self) {
        let mut slot = self.connection.lock().await;
        let outcome = match slot.as_mut() {
            Some(conn) => match conn.interrupt().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "interrupt signal failed");
                    InterruptOutcome::Disconnected
                }
            },
            None => InterruptOutcome::Disconnected,
        };
        match outcome {
            InterruptOutcome::Acknowledged => {
                self.state
                    .transition(ConnectionState::Interrupting, ConnectionState::Connected);
            }
            InterruptOutcome::Disconnected => {
                if let Some(mut conn) = slot.take() {
                    conn.disconnect().await;
                }
                self.state.force_disconnected();
            }
        }
    }

    /// Drop the channel after a fatal mid-stream failure.
    pub(crate) async fn fail_connection(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(mut conn) = slot.take() {
            conn.disconnect().await;
        }
        self.state.force_disconnected();
    }
}
