//! Wire types for the upstream agent's bidirectional frame protocol.
//!
//! One `execute` frame goes out after connect; a stream of tagged event
//! frames comes back until a terminal `done` or `error`. Undecodable frames
//! are dropped by the client with a warning — the stream keeps going.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tiller_core::types::{ModelTier, Usage};

/// Client → upstream. Sent exactly once per connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Execute {
        prompt: String,
        /// Empty string when we have no id to offer.
        session_id: String,
        /// `true` → upstream treats our id as authoritative; `false` → resume.
        is_new_session: bool,
        model: ModelTier,
        custom_instructions: String,
        thinking: bool,
    },
}

/// Upstream → client. One variant per wire `type`.
///
/// The correlator's exhaustive match over these variants is the protocol
/// state machine; add variants here and the compiler walks you through the
/// rest.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamEvent {
    /// The upstream's authoritative session id; may differ from ours.
    SessionId { session_id: String },

    /// Assistant visible text delta.
    Chunk { content: String },

    /// Reasoning delta; empty segments are legal.
    Thinking {
        #[serde(default)]
        content: String,
    },

    /// A tool invocation begins at a new content-block index.
    ToolStart { tool: ToolDescriptor },

    /// Partial JSON appended to the input of an in-progress tool.
    ToolInputDelta {
        tool: ToolRef,
        #[serde(default)]
        input_delta: String,
    },

    /// Heartbeat while a tool executes. Informational only.
    ToolProgress {
        tool: ToolRef,
        #[serde(default)]
        elapsed_time_seconds: f64,
    },

    /// Terminal frame for one tool invocation.
    ToolResult {
        tool: ToolRef,
        #[serde(default)]
        tool_output: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },

    /// Like `tool_result`, emitted when the upstream already knows it failed.
    ToolError {
        tool: ToolRef,
        #[serde(default)]
        tool_output: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },

    /// Token/cost snapshot. May arrive shortly after `done`.
    Usage { usage: Usage },

    /// Complete assistant message — the non-streaming fallback path.
    Assistant { message: AssistantMessage },

    /// Terminal frame for the turn.
    Done {
        #[serde(default)]
        content: String,
        #[serde(default)]
        session_id: String,
    },

    /// Terminal failure.
    Error { error: String },
}

/// Tool metadata carried on a `tool_start` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub tool_use_id: String,
    #[serde(default)]
    pub tool_name: String,
    /// Present when the upstream sends the full input up front instead of
    /// streaming `tool_input_delta` fragments.
    #[serde(default)]
    pub input: Option<Value>,
    /// Content-block index within the assistant message. When absent the
    /// correlator assigns the next free index.
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

/// Minimal tool reference used by delta/progress/result frames.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRef {
    pub tool_use_id: String,
}

/// Body of the non-streaming `assistant` fallback frame.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    /// Raw content blocks; each is interpreted individually so one unknown
    /// block type cannot poison the whole message.
    #[serde(default)]
    pub content: Vec<Value>,
}

/// A recognized assistant content block.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
}

impl ContentBlock {
    /// Interpret one raw block, returning `None` for unknown types.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Flatten a tool-result payload to display text.
///
/// Payloads are either plain strings or arrays of text blocks; arrays are
/// joined with newlines. Anything else is serialized as-is.
pub fn tool_output_text(output: &Value) -> String {
    match output {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|b| match b {
                Value::String(s) => s.clone(),
                Value::Object(map) => map
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
