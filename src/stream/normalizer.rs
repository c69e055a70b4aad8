//! Translation from engine-native messages to the domain event set.
//!
//! Pure and stateless. Unknown or malformed upstream messages degrade to a
//! single `Error` event without aborting the stream; only channel-level
//! failures (classified by [`EngineError::is_fatal`]) terminate it.

use tracing::warn;

use crate::engine::{ContentBlock, EngineError, EngineMessage};
use crate::stream::StreamEvent;

/// Result of normalizing one engine message or channel error.
#[derive(Clone, Debug, PartialEq)]
pub struct Normalized {
    /// Zero or more domain events, in upstream order.
    pub events: Vec<StreamEvent>,
    /// Whether the query's stream must end after these events.
    pub terminal: bool,
}

impl Normalized {
    fn events(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            terminal: false,
        }
    }

    fn terminal(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            terminal: true,
        }
    }
}

/// Normalize one engine message.
pub fn normalize(message: EngineMessage) -> Normalized {
    match message {
        EngineMessage::System { .. } => Normalized::events(vec![StreamEvent::Processing]),

        EngineMessage::Assistant { message } | EngineMessage::User { message } => {
            let events = message
                .content
                .into_iter()
                .filter_map(normalize_block)
                .collect();
            Normalized::events(events)
        }

        EngineMessage::Result {
            usage,
            total_cost_usd,
            is_error,
            result,
            ..
        } => {
            let usage = usage.unwrap_or_default();
            let mut events = Vec::with_capacity(2);
            if is_error {
                events.push(StreamEvent::error(
                    result.unwrap_or_else(|| "engine reported an error result".to_string()),
                ));
            }
            events.push(StreamEvent::Result {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost_usd: total_cost_usd.unwrap_or(0.0),
            });
            Normalized::terminal(events)
        }

        EngineMessage::Unknown => {
            warn!("unrecognized engine message type");
            Normalized::events(vec![StreamEvent::error("unrecognized engine message")])
        }
    }
}

fn normalize_block(block: ContentBlock) -> Option<StreamEvent> {
    match block {
        ContentBlock::Text { text } => Some(StreamEvent::AssistantText { text }),
        ContentBlock::ToolUse { id, name, .. } => Some(StreamEvent::ToolUse {
            tool_name: name,
            tool_id: id,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => Some(StreamEvent::ToolResult {
            tool_id: tool_use_id,
            payload: content,
        }),
        ContentBlock::Other => None,
    }
}

/// Normalize a channel-level failure.
///
/// Protocol noise (one bad message) keeps the stream alive; anything that
/// corrupts the channel itself forces termination, and the caller appends
/// the mandatory `Done`.
pub fn normalize_error(error: &EngineError) -> Normalized {
    let event = StreamEvent::error(error.to_string());
    if error.is_fatal() {
        Normalized::terminal(vec![event])
    } else {
        Normalized::events(vec![event])
    }
}
