// Verify the upstream frame format parses exactly as the agent emits it.
// These tests pin the wire contract; breaking one breaks live deployments.

use tiller_upstream::protocol::{tool_output_text, OutboundFrame, UpstreamEvent};

#[test]
fn execute_frame_wire_shape() {
    let frame = OutboundFrame::Execute {
        prompt: "hello".into(),
        session_id: "aaaa".into(),
        is_new_session: true,
        model: "haiku".parse().unwrap(),
        custom_instructions: String::new(),
        thinking: false,
    };
    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains(r#""type":"execute""#));
    assert!(json.contains(r#""model":"haiku""#));
    assert!(json.contains(r#""is_new_session":true"#));
}

#[test]
fn session_id_frame() {
    let ev: UpstreamEvent =
        serde_json::from_str(r#"{"type":"session_id","session_id":"bbbb"}"#).unwrap();
    assert!(matches!(ev, UpstreamEvent::SessionId { session_id } if session_id == "bbbb"));
}

#[test]
fn chunk_and_thinking_frames() {
    let ev: UpstreamEvent =
        serde_json::from_str(r#"{"type":"chunk","content":"Hi"}"#).unwrap();
    assert!(matches!(ev, UpstreamEvent::Chunk { content } if content == "Hi"));

    // Thinking segments may be empty.
    let ev: UpstreamEvent = serde_json::from_str(r#"{"type":"thinking"}"#).unwrap();
    assert!(matches!(ev, UpstreamEvent::Thinking { content } if content.is_empty()));
}

#[test]
fn tool_start_with_index_and_inline_input() {
    let ev: UpstreamEvent = serde_json::from_str(
        r#"{"type":"tool_start",
            "tool":{"tool_use_id":"t1","tool_name":"Bash","index":2,
                    "input":{"cmd":"ls"}}}"#,
    )
    .unwrap();
    match ev {
        UpstreamEvent::ToolStart { tool } => {
            assert_eq!(tool.tool_use_id, "t1");
            assert_eq!(tool.tool_name, "Bash");
            assert_eq!(tool.index, Some(2));
            assert_eq!(tool.input.unwrap()["cmd"], "ls");
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn tool_input_delta_frame() {
    let ev: UpstreamEvent = serde_json::from_str(
        r#"{"type":"tool_input_delta","tool":{"tool_use_id":"t1"},"input_delta":"{\"cmd\":"}"#,
    )
    .unwrap();
    match ev {
        UpstreamEvent::ToolInputDelta { tool, input_delta } => {
            assert_eq!(tool.tool_use_id, "t1");
            assert_eq!(input_delta, "{\"cmd\":");
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn tool_result_string_output() {
    let ev: UpstreamEvent = serde_json::from_str(
        r#"{"type":"tool_result","tool":{"tool_use_id":"t1"},
            "tool_output":"a\nb","is_error":false}"#,
    )
    .unwrap();
    match ev {
        UpstreamEvent::ToolResult {
            tool,
            tool_output,
            is_error,
        } => {
            assert_eq!(tool.tool_use_id, "t1");
            assert_eq!(tool_output_text(&tool_output), "a\nb");
            assert_eq!(is_error, Some(false));
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn tool_result_block_array_output() {
    let ev: UpstreamEvent = serde_json::from_str(
        r#"{"type":"tool_result","tool":{"tool_use_id":"t2"},
            "tool_output":[{"type":"text","text":"one"},{"type":"text","text":"two"}]}"#,
    )
    .unwrap();
    match ev {
        UpstreamEvent::ToolResult {
            tool_output,
            is_error,
            ..
        } => {
            assert_eq!(tool_output_text(&tool_output), "one\ntwo");
            // Absent is_error stays undetermined so the frame type decides.
            assert_eq!(is_error, None);
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn usage_frame() {
    let ev: UpstreamEvent = serde_json::from_str(
        r#"{"type":"usage","usage":{"input_tokens":120,"output_tokens":45,
            "cache_read_input_tokens":2000,"total_cost_usd":0.0123}}"#,
    )
    .unwrap();
    match ev {
        UpstreamEvent::Usage { usage } => {
            assert_eq!(usage.input_tokens, 120);
            assert_eq!(usage.output_tokens, 45);
            assert_eq!(usage.cache_read_input_tokens, 2000);
        }
        other => panic!("wrong variant: {other:?}"),
    }
}

#[test]
fn done_frame_defaults() {
    let ev: UpstreamEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
    assert!(matches!(
        ev,
        UpstreamEvent::Done { content, session_id }
            if content.is_empty() && session_id.is_empty()
    ));
}

#[test]
fn error_frame() {
    let ev: UpstreamEvent =
        serde_json::from_str(r#"{"type":"error","error":"model overloaded"}"#).unwrap();
    assert!(matches!(ev, UpstreamEvent::Error { error } if error == "model overloaded"));
}

#[test]
fn unknown_frame_type_fails_to_decode() {
    // The reader drops undecodable frames; this pins that an unknown tag is
    // in fact a decode failure rather than silently matching a variant.
    assert!(serde_json::from_str::<UpstreamEvent>(r#"{"type":"telemetry","x":1}"#).is_err());
}

#[test]
fn assistant_fallback_frame_blocks() {
    let ev: UpstreamEvent = serde_json::from_str(
        r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Hi there"},
            {"type":"thinking","thinking":"hmm"},
            {"type":"unknown_block","x":1}]}}"#,
    )
    .unwrap();
    match ev {
        UpstreamEvent::Assistant { message } => assert_eq!(message.content.len(), 3),
        other => panic!("wrong variant: {other:?}"),
    }
}
