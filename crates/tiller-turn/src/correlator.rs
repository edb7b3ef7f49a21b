//! Reconstructs coherent tool-call records from the upstream's interleaved
//! partial-input deltas, start frames, and asynchronous result frames.
//!
//! All state is per-turn scratchpad owned by one task: a map from content-
//! block index to the in-progress draft, a parallel partial-JSON buffer, and
//! a `tool_use_id → index` reverse map so result frames (which carry no
//! index) find their block. Everything clears on the upstream's session-id
//! marker. No global tool registry exists — the correlator is a function of
//! (frame, per-turn state).

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use tiller_store::types::ToolStatus;
use tiller_store::{Store, StoreError};
use tiller_upstream::protocol::{tool_output_text, ContentBlock, ToolDescriptor};
use tiller_upstream::UpstreamEvent;

use crate::error::Result;
use crate::events::TurnEvent;

struct ToolDraft {
    tool_use_id: String,
    tool_name: String,
    /// Input sent inline on the start frame; used only when no deltas follow.
    base_input: Option<Value>,
    parent_tool_use_id: Option<String>,
}

/// Per-turn protocol state machine. See module docs.
pub struct Correlator {
    active_tools: HashMap<u32, ToolDraft>,
    tool_inputs: HashMap<u32, String>,
    index_by_tool_use_id: HashMap<String, u32>,
    next_index: u32,
    /// Whether any `chunk` frame was seen for the current assistant message;
    /// suppresses the non-streaming fallback frame to avoid duplicate text.
    streamed_any: bool,
    /// Whether any visible text was emitted this turn (streamed or fallback);
    /// decides if `done.content` still needs surfacing.
    emitted_text: bool,
    in_thinking: bool,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            active_tools: HashMap::new(),
            tool_inputs: HashMap::new(),
            index_by_tool_use_id: HashMap::new(),
            next_index: 0,
            streamed_any: false,
            emitted_text: false,
            in_thinking: false,
        }
    }

    /// Apply one upstream frame, mutate per-turn state, persist tool-call
    /// transitions, and return the outward events in order.
    ///
    /// Must be called from a single task; no suspension happens between
    /// reading a frame and updating the maps.
    pub fn handle(
        &mut self,
        store: &Store,
        session_id: &str,
        event: UpstreamEvent,
    ) -> Result<Vec<TurnEvent>> {
        match event {
            UpstreamEvent::SessionId { session_id } => {
                self.reset();
                Ok(vec![TurnEvent::SessionId { session_id }])
            }

            UpstreamEvent::Chunk { content } => {
                let mut out = self.close_thinking();
                self.streamed_any = true;
                self.emitted_text = true;
                out.push(TurnEvent::AssistantDelta { content });
                Ok(out)
            }

            UpstreamEvent::Thinking { content } => {
                self.in_thinking = true;
                Ok(vec![TurnEvent::ThinkingDelta { content }])
            }

            UpstreamEvent::ToolStart { tool } => self.on_tool_start(store, session_id, tool),

            UpstreamEvent::ToolInputDelta { tool, input_delta } => {
                if let Some(index) = self.index_by_tool_use_id.get(&tool.tool_use_id) {
                    self.tool_inputs
                        .entry(*index)
                        .or_default()
                        .push_str(&input_delta);
                } else {
                    debug!(tool_use_id = %tool.tool_use_id, "input delta for unknown tool");
                }
                Ok(vec![TurnEvent::ToolInputDelta {
                    tool_use_id: tool.tool_use_id,
                    input_delta,
                }])
            }

            UpstreamEvent::ToolProgress {
                tool,
                elapsed_time_seconds,
            } => Ok(vec![TurnEvent::ToolProgress {
                tool_use_id: tool.tool_use_id,
                elapsed_time_seconds,
            }]),

            UpstreamEvent::ToolResult {
                tool,
                tool_output,
                is_error,
            } => self.on_tool_result(store, tool.tool_use_id, tool_output, is_error, false),

            UpstreamEvent::ToolError {
                tool,
                tool_output,
                is_error,
            } => self.on_tool_result(store, tool.tool_use_id, tool_output, is_error, true),

            UpstreamEvent::Usage { usage } => Ok(vec![TurnEvent::Usage { usage }]),

            UpstreamEvent::Assistant { message } => {
                if self.streamed_any {
                    // Already rendered via chunk frames; the fallback would
                    // duplicate the text.
                    return Ok(Vec::new());
                }
                let mut out = Vec::new();
                for raw in &message.content {
                    match ContentBlock::from_value(raw) {
                        Some(ContentBlock::Text { text }) => {
                            self.emitted_text = true;
                            out.extend(self.close_thinking());
                            out.push(TurnEvent::AssistantDelta { content: text });
                        }
                        Some(ContentBlock::Thinking { thinking }) => {
                            self.in_thinking = true;
                            out.push(TurnEvent::ThinkingDelta { content: thinking });
                        }
                        None => {}
                    }
                }
                Ok(out)
            }

            UpstreamEvent::Done { content, .. } => {
                let mut out = self.close_thinking();
                if !self.emitted_text && !content.is_empty() {
                    // Nothing was streamed and no fallback arrived; the
                    // terminal frame is the only copy of the text.
                    self.emitted_text = true;
                    out.push(TurnEvent::AssistantDelta { content });
                }
                Ok(out)
            }

            // Terminal failure is the coordinator's problem; no state here.
            UpstreamEvent::Error { .. } => Ok(Vec::new()),
        }
    }

    fn on_tool_start(
        &mut self,
        store: &Store,
        session_id: &str,
        tool: ToolDescriptor,
    ) -> Result<Vec<TurnEvent>> {
        let mut out = self.close_thinking();

        let index = tool.index.unwrap_or(self.next_index);
        self.next_index = self.next_index.max(index + 1);
        if index == 0 {
            // Block index 0 opens a new assistant message; the stream-seen
            // flag is scoped to the message boundary.
            self.streamed_any = false;
        }

        let input = tool.input.clone().unwrap_or_else(empty_object);
        store.upsert_tool_call(&tool.tool_use_id, session_id, &tool.tool_name, &input)?;

        self.index_by_tool_use_id
            .insert(tool.tool_use_id.clone(), index);
        self.tool_inputs.insert(index, String::new());
        self.active_tools.insert(
            index,
            ToolDraft {
                tool_use_id: tool.tool_use_id.clone(),
                tool_name: tool.tool_name.clone(),
                base_input: tool.input,
                parent_tool_use_id: tool.parent_tool_use_id.clone(),
            },
        );

        out.push(TurnEvent::ToolStart {
            tool_use_id: tool.tool_use_id,
            tool_name: tool.tool_name,
            input,
            parent_tool_use_id: tool.parent_tool_use_id,
        });
        Ok(out)
    }

    fn on_tool_result(
        &mut self,
        store: &Store,
        tool_use_id: String,
        tool_output: Value,
        is_error: Option<bool>,
        frame_is_error: bool,
    ) -> Result<Vec<TurnEvent>> {
        // The payload flag, when present, overrides the frame-type heuristic.
        let is_error = is_error.unwrap_or(frame_is_error);
        let output = tool_output_text(&tool_output);
        let status = if is_error {
            ToolStatus::Error
        } else {
            ToolStatus::Success
        };

        let input = match self.index_by_tool_use_id.remove(&tool_use_id) {
            Some(index) => {
                let draft = self.active_tools.remove(&index);
                let buffer = self.tool_inputs.remove(&index).unwrap_or_default();
                if !buffer.is_empty() {
                    // Accumulated partial-JSON fragments; parse only now that
                    // the block is closed. A malformed buffer keeps the input
                    // empty rather than failing the turn.
                    serde_json::from_str(&buffer).unwrap_or_else(|e| {
                        warn!(tool_use_id, error = %e, "tool input buffer did not parse");
                        empty_object()
                    })
                } else {
                    draft.and_then(|d| d.base_input).unwrap_or_else(empty_object)
                }
            }
            None => {
                // Result for a tool we never saw start — forward best-effort.
                debug!(tool_use_id, "result for unknown tool_use_id");
                empty_object()
            }
        };

        match store.finalize_tool_call(&tool_use_id, &input, &output, status) {
            Ok(()) => {}
            // Unknown tool_use_id has no row to finalize; not this turn's
            // failure.
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(vec![TurnEvent::ToolResult {
            tool_use_id,
            output,
            is_error,
        }])
    }

    /// Emit `ThinkingEnd` once when leaving a reasoning section.
    fn close_thinking(&mut self) -> Vec<TurnEvent> {
        if self.in_thinking {
            self.in_thinking = false;
            vec![TurnEvent::ThinkingEnd]
        } else {
            Vec::new()
        }
    }

    fn reset(&mut self) {
        self.active_tools.clear();
        self.tool_inputs.clear();
        self.index_by_tool_use_id.clear();
        self.next_index = 0;
        self.streamed_any = false;
        self.in_thinking = false;
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}
