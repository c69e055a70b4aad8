//! Engine-native wire messages.
//!
//! The upstream engine speaks line-delimited stream-JSON: one message object
//! per line, discriminated by `type`. These shapes mirror what the engine
//! actually emits; translation into the domain event set lives in
//! [`crate::stream::normalizer`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message from the engine channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    /// Channel status: init banner, progress notices.
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// An assistant turn carrying content blocks.
    Assistant { message: MessagePayload },
    /// A user-side turn; in practice tool results echoed back by the engine.
    User { message: MessagePayload },
    /// Terminal accounting message, exactly one per query.
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        usage: Option<UsageInfo>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
    /// Anything this version does not recognize. Tolerated, never fatal.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

/// Token usage reported by the engine's result message.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl EngineMessage {
    /// Whether this message terminates the current query's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineMessage::Result { .. })
    }
}

/// Parse one stdout line into an engine message.
pub fn parse_line(line: &str) -> Result<EngineMessage, serde_json::Error> {
    serde_json::from_str(line)
}

/// The stdin frame submitting a prompt on a persistent channel.
pub fn user_prompt_frame(prompt: &str) -> Value {
    serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": prompt },
    })
}

/// The stdin frame requesting mid-stream cancellation.
pub fn interrupt_frame(request_id: &str) -> Value {
    serde_json::json!({
        "type": "control_request",
        "request_id": request_id,
        "request": { "subtype": "interrupt" },
    })
}
