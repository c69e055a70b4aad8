//! The per-query event pump.
//!
//! Models the engine's push-style callbacks as a pull-based, lazy, finite,
//! non-restartable stream. A small phase machine drives one query from
//! submission to the mandatory trailing `Done`; interrupt signals and the
//! query timeout enter through the same `select!` as upstream events, so
//! ordering within the turn is preserved.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handle::SessionInner;
use super::state::ConnectionState;
use crate::engine::EventStream;
use crate::stream::{StreamEvent, normalize, normalize_error};

/// Event stream for one query. Ends with exactly one `Done`, whatever
/// happens upstream; dropping it early marks the channel for
/// re-provisioning, since a half-consumed engine stream cannot be reused.
pub struct QueryStream {
    inner: Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
}

impl QueryStream {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
        prompt: String,
        timeout: Option<Duration>,
    ) -> Self {
        let turn = Turn {
            session,
            permit: Some(permit),
            cancel,
            prompt,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            pending: VecDeque::new(),
            phase: Phase::Start,
            finished: false,
        };
        let events = stream::unfold(turn, |mut turn| async move {
            turn.next_event().await.map(|event| (event, turn))
        });
        Self {
            inner: Box::pin(events),
        }
    }
}

impl Stream for QueryStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream").finish_non_exhaustive()
    }
}

enum Phase {
    /// Connection not yet established for this turn.
    Start,
    /// Pumping engine events.
    Streaming { events: EventStream },
    /// Terminal events queued; emit `Done` next.
    Finishing,
    Ended,
}

struct Turn {
    session: Arc<SessionInner>,
    permit: Option<OwnedSemaphorePermit>,
    cancel: CancellationToken,
    prompt: String,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    pending: VecDeque<StreamEvent>,
    phase: Phase,
    finished: bool,
}

impl Turn {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if let StreamEvent::Result {
                    input_tokens,
                    output_tokens,
                    cost_usd,
                } = &event
                {
                    self.session
                        .apply_result(*input_tokens, *output_tokens, *cost_usd);
                }
                return Some(event);
            }

            match std::mem::replace(&mut self.phase, Phase::Ended) {
                Phase::Start => {
                    if self.cancel.is_cancelled() {
                        self.phase = Phase::Finishing;
                        continue;
                    }
                    match self.session.establish_and_submit(&self.prompt).await {
                        Ok(events) => self.phase = Phase::Streaming { events },
                        Err(e) => {
                            warn!(session_id = %self.session.id, error = %e, "query setup failed");
                            self.pending.push_back(StreamEvent::error(e.to_string()));
                            self.phase = Phase::Finishing;
                        }
                    }
                }

                Phase::Streaming { mut events } => {
                    let cancel = self.cancel.clone();
                    tokio::select! {
                        biased;
                        // interrupt() / destroy settle connection and state
                        // on their side; this turn only has to wind down.
                        _ = cancel.cancelled() => {
                            debug!(session_id = %self.session.id, "query cancelled");
                            self.phase = Phase::Finishing;
                        }
                        _ = expired(self.deadline) => {
                            self.handle_timeout().await;
                            self.phase = Phase::Finishing;
                        }
                        item = events.next() => match item {
                            Some(Ok(msg)) => {
                                let normalized = normalize(msg);
                                self.pending.extend(normalized.events);
                                if normalized.terminal {
                                    self.complete();
                                    self.phase = Phase::Finishing;
                                } else {
                                    self.phase = Phase::Streaming { events };
                                }
                            }
                            Some(Err(e)) => {
                                let normalized = normalize_error(&e);
                                self.pending.extend(normalized.events);
                                if normalized.terminal {
                                    warn!(session_id = %self.session.id, error = %e, "engine channel failed mid-query");
                                    self.session.fail_connection().await;
                                    self.phase = Phase::Finishing;
                                } else {
                                    self.phase = Phase::Streaming { events };
                                }
                            }
                            // Engine closed the turn without a result message.
                            None => {
                                self.complete();
                                self.phase = Phase::Finishing;
                            }
                        }
                    }
                }

                Phase::Finishing => {
                    self.finish();
                    self.phase = Phase::Ended;
                    return Some(StreamEvent::Done);
                }

                Phase::Ended => return None,
            }
        }
    }

    /// Natural completion. Losing the CAS means an interrupt is settling the
    /// state on its own side; leave it alone.
    fn complete(&self) {
        self.session
            .state
            .transition(ConnectionState::Busy, ConnectionState::Connected);
    }

    /// A timeout is an interrupt with an `Error` attached, not a session
    /// failure.
    async fn handle_timeout(&mut self) {
        let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
        warn!(session_id = %self.session.id, timeout_secs = secs, "query timed out");
        if self
            .session
            .state
            .transition(ConnectionState::Busy, ConnectionState::Interrupting)
        {
            self.session.settle_interrupt().await;
        }
        self.pending
            .push_back(StreamEvent::error(format!("query timed out after {}s", secs)));
    }

    fn finish(&mut self) {
        self.finished = true;
        self.session.clear_query_cancel();
        self.session.touch();
        // Releases the serialization permit; the next send may proceed.
        self.permit.take();
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned mid-query: the channel may hold a half-consumed
            // stream, so the next query must rebuild it.
            self.session.reprovision.store(true, Ordering::Release);
            self.session.state.force_disconnected();
            self.session.clear_query_cancel();
        }
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
