//! Scripted in-memory engine shared by the integration tests.
//!
//! `ScriptedFactory` replaces the subprocess connection factory: each
//! `submit` consumes the next queued script, and steps can inject delays,
//! protocol noise, channel failures, or an indefinite hang to exercise
//! interrupt and timeout paths.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use claude_sessions::{
    Connection, ConnectionFactory, EngineError, EngineMessage, EngineResult, EventStream,
    InterruptOutcome, SessionConfig,
};
use claude_sessions::engine::{ContentBlock, MessagePayload, UsageInfo};

/// One step in a scripted query stream.
#[derive(Clone)]
pub enum Step {
    Event(EngineMessage),
    Delay(Duration),
    ProtocolError(&'static str),
    ChannelFailure,
    /// Never yields another event; the query hangs until cancelled.
    Hang,
}

pub fn text(s: &str) -> Step {
    Step::Event(EngineMessage::Assistant {
        message: MessagePayload {
            content: vec![ContentBlock::Text { text: s.into() }],
        },
    })
}

pub fn tool_use(id: &str, name: &str) -> Step {
    Step::Event(EngineMessage::Assistant {
        message: MessagePayload {
            content: vec![ContentBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input: serde_json::json!({}),
            }],
        },
    })
}

pub fn result(input: u64, output: u64, cost: f64) -> Step {
    Step::Event(EngineMessage::Result {
        subtype: Some("success".into()),
        usage: Some(UsageInfo {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }),
        total_cost_usd: Some(cost),
        num_turns: Some(1),
        is_error: false,
        result: None,
    })
}

#[derive(Default)]
struct FactoryState {
    connect_failures: AtomicUsize,
    queries: Mutex<VecDeque<Vec<Step>>>,
    opened: AtomicUsize,
    interrupts: AtomicUsize,
    force_disconnect_on_interrupt: AtomicUsize,
}

pub struct ScriptedFactory {
    state: Arc<FactoryState>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(FactoryState::default()),
        })
    }

    /// Queue the event script for the next query, in submission order.
    pub fn push_query(&self, steps: Vec<Step>) {
        self.state.queries.lock().unwrap().push_back(steps);
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Resolve interrupts by forced teardown instead of acknowledgement.
    pub fn force_disconnect_on_interrupt(&self) {
        self.state
            .force_disconnect_on_interrupt
            .store(1, Ordering::SeqCst);
    }

    /// Connections opened so far (one per provision, not per query).
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.state.interrupts.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for ScriptedFactory {
    fn open(&self, _config: &SessionConfig) -> Box<dyn Connection> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedConnection {
            state: Arc::clone(&self.state),
            connected: false,
        })
    }
}

struct ScriptedConnection {
    state: Arc<FactoryState>,
    connected: bool,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn connect(&mut self) -> EngineResult<()> {
        let failures = &self.state.connect_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::ConnectionFailed {
                message: "scripted connect failure".into(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn submit(&mut self, _prompt: &str) -> EngineResult<EventStream> {
        if !self.connected {
            return Err(EngineError::NotConnected);
        }
        let steps = self
            .state
            .queries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![result(1, 1, 0.0)]);

        let events = futures::stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                return match steps.next() {
                    Some(Step::Delay(duration)) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    Some(Step::Hang) => {
                        std::future::pending::<()>().await;
                        unreachable!("pending future resolved");
                    }
                    Some(Step::Event(msg)) => Some((Ok(msg), steps)),
                    Some(Step::ProtocolError(message)) => Some((
                        Err(EngineError::Protocol {
                            message: message.to_string(),
                        }),
                        steps,
                    )),
                    Some(Step::ChannelFailure) => Some((Err(EngineError::ChannelClosed), steps)),
                    None => None,
                };
            }
        });
        Ok(Box::pin(events))
    }

    async fn interrupt(&mut self) -> EngineResult<InterruptOutcome> {
        self.state.interrupts.fetch_add(1, Ordering::SeqCst);
        if self
            .state
            .force_disconnect_on_interrupt
            .load(Ordering::SeqCst)
            != 0
        {
            self.connected = false;
            Ok(InterruptOutcome::Disconnected)
        } else {
            Ok(InterruptOutcome::Acknowledged)
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
