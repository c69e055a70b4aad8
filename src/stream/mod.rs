//! The normalized event stream relayed to callers.
//!
//! Every query produces a lazy, finite sequence of [`StreamEvent`]s ending in
//! exactly one `Done`, regardless of success, failure, or interruption. The
//! transport layer relays each event as one discrete frame (e.g. one SSE
//! `data:` line); the `type` discriminator below is that frame's tag.

pub mod normalizer;

pub use normalizer::{Normalized, normalize, normalize_error};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One normalized unit of output from a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The engine accepted the query and is working.
    Processing,
    AssistantText {
        text: String,
    },
    ToolUse {
        tool_name: String,
        tool_id: String,
    },
    ToolResult {
        tool_id: String,
        payload: Value,
    },
    /// Terminal accounting for the turn. Feeds the session's cumulative
    /// counters before `Done` closes the stream.
    Result {
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    Error {
        message: String,
    },
    Done,
}

impl StreamEvent {
    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done)
    }
}
