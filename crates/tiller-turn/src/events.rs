use serde_json::Value;

use tiller_core::types::Usage;

/// Outward events produced while a turn runs.
///
/// The correlator emits these in frame-arrival order; the gateway serializes
/// them onto the client channel and the coordinator taps them for
/// persistence and usage metering.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// The upstream's authoritative session id for this turn.
    SessionId { session_id: String },

    /// Assistant visible text delta.
    AssistantDelta { content: String },

    /// Reasoning delta.
    ThinkingDelta { content: String },

    /// The reasoning section of the current assistant message ended.
    ThinkingEnd,

    ToolStart {
        tool_use_id: String,
        tool_name: String,
        input: Value,
        parent_tool_use_id: Option<String>,
    },

    ToolInputDelta {
        tool_use_id: String,
        input_delta: String,
    },

    /// Heartbeat while a tool runs. The only event the gateway may drop
    /// under back-pressure.
    ToolProgress {
        tool_use_id: String,
        elapsed_time_seconds: f64,
    },

    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },

    Usage { usage: Usage },

    /// A freshly generated session title.
    SessionTitle { session_id: String, title: String },

    /// The turn completed; terminal on the happy path.
    Done,
}
