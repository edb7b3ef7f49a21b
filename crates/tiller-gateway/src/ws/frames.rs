//! The JSON frame protocol spoken with browsers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tiller_core::types::{Attachment, ModelTier, Usage};
use tiller_turn::TurnEvent;

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Start a turn on a (possibly new) session.
    Message {
        session_id: String,
        content: String,
        model: ModelTier,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        machine_id: Option<String>,
        #[serde(default)]
        is_new_session: bool,
    },
    /// Abort the session's active turn, if any.
    Cancel { session_id: String },
}

/// Server → client frames. One variant per wire `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Chunk {
        content: String,
    },
    Thinking {
        content: String,
    },
    ThinkingEnd,
    SessionId {
        session_id: String,
    },
    SessionTitle {
        session_id: String,
        title: String,
    },
    ToolStart {
        tool: ToolStartPayload,
    },
    ToolInputDelta {
        tool: ToolIdPayload,
        input_delta: String,
    },
    ToolProgress {
        tool: ToolIdPayload,
        elapsed_time_seconds: f64,
    },
    ToolResult {
        tool: ToolIdPayload,
        tool_output: String,
        is_error: bool,
    },
    ToolError {
        tool: ToolIdPayload,
        tool_output: String,
        is_error: bool,
    },
    Usage {
        usage: Usage,
    },
    Done,
    Error {
        code: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStartPayload {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolIdPayload {
    pub tool_use_id: String,
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            error: message.into(),
        }
    }

    /// Serialize for the wire. Infallible by construction.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<TurnEvent> for ServerEvent {
    fn from(event: TurnEvent) -> Self {
        match event {
            TurnEvent::SessionId { session_id } => ServerEvent::SessionId { session_id },
            TurnEvent::AssistantDelta { content } => ServerEvent::Chunk { content },
            TurnEvent::ThinkingDelta { content } => ServerEvent::Thinking { content },
            TurnEvent::ThinkingEnd => ServerEvent::ThinkingEnd,
            TurnEvent::ToolStart {
                tool_use_id,
                tool_name,
                input,
                parent_tool_use_id,
            } => ServerEvent::ToolStart {
                tool: ToolStartPayload {
                    tool_use_id,
                    tool_name,
                    input,
                    parent_tool_use_id,
                },
            },
            TurnEvent::ToolInputDelta {
                tool_use_id,
                input_delta,
            } => ServerEvent::ToolInputDelta {
                tool: ToolIdPayload { tool_use_id },
                input_delta,
            },
            TurnEvent::ToolProgress {
                tool_use_id,
                elapsed_time_seconds,
            } => ServerEvent::ToolProgress {
                tool: ToolIdPayload { tool_use_id },
                elapsed_time_seconds,
            },
            TurnEvent::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => {
                let tool = ToolIdPayload { tool_use_id };
                if is_error {
                    ServerEvent::ToolError {
                        tool,
                        tool_output: output,
                        is_error,
                    }
                } else {
                    ServerEvent::ToolResult {
                        tool,
                        tool_output: output,
                        is_error,
                    }
                }
            }
            TurnEvent::Usage { usage } => ServerEvent::Usage { usage },
            TurnEvent::SessionTitle { session_id, title } => {
                ServerEvent::SessionTitle { session_id, title }
            }
            TurnEvent::Done => ServerEvent::Done,
        }
    }
}
