// End-to-end turn scenarios driven through the coordinator with a scripted
// upstream. The store is a real in-memory SQLite database; only the wire is
// faked.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tiller_core::types::ModelTier;
use tiller_store::types::{Role, ToolStatus};
use tiller_store::Store;
use tiller_turn::{TurnCoordinator, TurnError, TurnEvent, TurnRegistry, UserTurnRequest};
use tiller_upstream::client::{ExecuteRequest, UpstreamConnector};
use tiller_upstream::protocol::{ToolDescriptor, ToolRef};
use tiller_upstream::UpstreamEvent;

/// One step of a scripted upstream connection.
enum Step {
    Emit(UpstreamEvent),
    /// Keep the connection open until the turn is cancelled, then close it —
    /// models the transport teardown a real cancel produces.
    WaitCancel,
}

/// Scripted connector: each `execute` call consumes the next script from the
/// queue. An exhausted queue yields a connection that closes immediately.
struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<ExecuteRequest>>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request(&self, idx: usize) -> ExecuteRequest {
        self.requests.lock().unwrap()[idx].clone()
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn execute(
        &self,
        req: ExecuteRequest,
        cancel: CancellationToken,
    ) -> tiller_upstream::error::Result<mpsc::Receiver<UpstreamEvent>> {
        self.requests.lock().unwrap().push(req);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Emit(ev) => {
                        if tx.send(ev).await.is_err() {
                            return;
                        }
                    }
                    Step::WaitCancel => {
                        cancel.cancelled().await;
                        // Hold the transport open while it tears down so the
                        // coordinator observes the cancel, not a close.
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn session_id(id: &str) -> Step {
    Step::Emit(UpstreamEvent::SessionId {
        session_id: id.into(),
    })
}

fn chunk(text: &str) -> Step {
    Step::Emit(UpstreamEvent::Chunk {
        content: text.into(),
    })
}

fn done() -> Step {
    Step::Emit(UpstreamEvent::Done {
        content: String::new(),
        session_id: String::new(),
    })
}

fn request(session: &str, content: &str, is_new: bool) -> UserTurnRequest {
    UserTurnRequest {
        session_id: session.into(),
        content: content.into(),
        model: ModelTier::Fast,
        attachments: Vec::new(),
        machine_id: None,
        is_new_session: is_new,
    }
}

struct Harness {
    store: Arc<Store>,
    registry: Arc<TurnRegistry>,
    coordinator: Arc<TurnCoordinator>,
}

fn harness(connector: Arc<ScriptedConnector>) -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let registry = Arc::new(TurnRegistry::new());
    let coordinator = Arc::new(TurnCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        connector,
        "/workspace",
    ));
    Harness {
        store,
        registry,
        coordinator,
    }
}

/// Drain events until `Done` (inclusive) or the channel closes.
async fn drain_until_done(rx: &mut mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ev)) => {
                let is_done = matches!(ev, TurnEvent::Done);
                events.push(ev);
                if is_done {
                    return events;
                }
            }
            Ok(None) => return events,
            Err(_) => panic!("timed out waiting for events"),
        }
    }
}

// S1 — new session, plain streamed text.
#[tokio::test]
async fn new_session_plain_text() {
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        chunk("Hi"),
        chunk(" there"),
        done(),
    ]]);
    let h = harness(Arc::clone(&connector));

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap();

    let events = drain_until_done(&mut rx).await;
    assert!(matches!(&events[0], TurnEvent::SessionId { session_id } if session_id == "aaaa"));
    assert!(matches!(&events[1], TurnEvent::AssistantDelta { content } if content == "Hi"));
    assert!(matches!(&events[2], TurnEvent::AssistantDelta { content } if content == " there"));
    assert!(matches!(events.last(), Some(TurnEvent::Done)));

    let messages = h.store.get_messages("aaaa").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hi there");

    assert!(!h.registry.is_active("aaaa"), "slot released after turn");
}

// S2 — tool call with streamed JSON input.
#[tokio::test]
async fn tool_call_with_streamed_input() {
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        Step::Emit(UpstreamEvent::ToolStart {
            tool: ToolDescriptor {
                tool_use_id: "t1".into(),
                tool_name: "Bash".into(),
                input: None,
                index: Some(2),
                parent_tool_use_id: None,
            },
        }),
        Step::Emit(UpstreamEvent::ToolInputDelta {
            tool: ToolRef {
                tool_use_id: "t1".into(),
            },
            input_delta: "{\"cmd\":".into(),
        }),
        Step::Emit(UpstreamEvent::ToolInputDelta {
            tool: ToolRef {
                tool_use_id: "t1".into(),
            },
            input_delta: "\"ls\"}".into(),
        }),
        Step::Emit(UpstreamEvent::ToolResult {
            tool: ToolRef {
                tool_use_id: "t1".into(),
            },
            tool_output: json!("a\nb"),
            is_error: Some(false),
        }),
        chunk("done"),
        done(),
    ]]);
    let h = harness(connector);

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "run ls", true), tx)
        .await
        .unwrap();
    drain_until_done(&mut rx).await;

    let call = h.store.get_tool_call("t1").unwrap();
    assert_eq!(call.input, json!({"cmd": "ls"}));
    assert_eq!(call.output.as_deref(), Some("a\nb"));
    assert_eq!(call.status, ToolStatus::Success);
    assert_eq!(call.session_id, "aaaa");
}

// S3 — the upstream mints a new id on resume; everything is rekeyed.
#[tokio::test]
async fn session_relink_on_resume() {
    let connector = ScriptedConnector::new(vec![
        vec![session_id("aaaa"), chunk("first"), done()],
        vec![session_id("bbbb"), chunk("resumed"), done()],
    ]);
    let h = harness(connector);

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap();
    drain_until_done(&mut rx).await;

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "continue", false), tx)
        .await
        .unwrap();
    let events = drain_until_done(&mut rx).await;

    assert!(
        events
            .iter()
            .any(|e| matches!(e, TurnEvent::SessionId { session_id } if session_id == "bbbb")),
        "client must learn the new id"
    );

    assert!(h.store.get_session("aaaa").is_err());
    let session = h.store.get_session("bbbb").unwrap();
    assert_eq!(session.claude_session_id.as_deref(), Some("bbbb"));

    let messages = h.store.get_messages("bbbb").unwrap();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["hello", "first", "continue", "resumed"]);
}

// S4 — a second message on a busy session is rejected, not queued.
#[tokio::test]
async fn concurrent_turn_rejected() {
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        chunk("part"),
        Step::WaitCancel,
    ]]);
    let h = harness(connector);

    let (tx, mut rx) = mpsc::channel(100);
    let coordinator = Arc::clone(&h.coordinator);
    let first = tokio::spawn(async move {
        coordinator.run_turn(request("aaaa", "one", true), tx).await
    });

    // Wait for the first turn to claim the slot.
    while !h.registry.is_active("aaaa") {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (tx2, _rx2) = mpsc::channel(100);
    let err = h
        .coordinator
        .run_turn(request("aaaa", "two", true), tx2)
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::TurnInFlight));
    assert_eq!(err.code(), "busy");

    // Let the first turn finish via cancellation.
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(ev) = rx.recv().await {
            if matches!(ev, TurnEvent::AssistantDelta { .. }) {
                break;
            }
        }
    })
    .await
    .unwrap();
    h.registry.cancel("aaaa");
    first.await.unwrap().unwrap();

    // Only the first turn's messages exist: one user, one partial assistant.
    let messages = h.store.get_messages("aaaa").unwrap();
    let assistant: Vec<_> = messages.iter().filter(|m| m.role == Role::Assistant).collect();
    assert_eq!(assistant.len(), 1);
    let user: Vec<_> = messages.iter().filter(|m| m.role == Role::User).collect();
    assert_eq!(user.len(), 1);
}

// S5 — cancellation preserves the partial reply and emits no `done`.
#[tokio::test]
async fn cancellation_preserves_partial() {
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        chunk("part1"),
        Step::WaitCancel,
    ]]);
    let h = harness(connector);

    let (tx, mut rx) = mpsc::channel(100);
    let coordinator = Arc::clone(&h.coordinator);
    let turn = tokio::spawn(async move {
        coordinator.run_turn(request("aaaa", "hello", true), tx).await
    });

    // Observe the partial, then cancel mid-stream.
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(ev) = rx.recv().await {
            if matches!(&ev, TurnEvent::AssistantDelta { content } if content == "part1") {
                break;
            }
        }
    })
    .await
    .unwrap();
    h.registry.cancel("aaaa");
    turn.await.unwrap().unwrap();

    // No `done` after the cancel; the channel just closes.
    let mut saw_done = false;
    while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        saw_done |= matches!(ev, TurnEvent::Done);
    }
    assert!(!saw_done, "cancelled turn must not emit done");

    let messages = h.store.get_messages("aaaa").unwrap();
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "part1");
    assert!(!h.registry.is_active("aaaa"), "slot released after cancel");
}

// Upstream terminal error: partial is kept, the turn reports failure.
#[tokio::test]
async fn upstream_error_frame_fails_turn() {
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        chunk("so far"),
        Step::Emit(UpstreamEvent::Error {
            error: "model overloaded".into(),
        }),
    ]]);
    let h = harness(connector);

    let (tx, _rx) = mpsc::channel(100);
    let err = h
        .coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::TurnFailed(_)));
    assert_eq!(err.code(), "turn_failed");

    let messages = h.store.get_messages("aaaa").unwrap();
    assert_eq!(messages[1].content, "so far");
    assert!(!h.registry.is_active("aaaa"));
}

// Transport close with zero accumulated text is a failed turn.
#[tokio::test]
async fn transport_close_without_content_fails() {
    let connector = ScriptedConnector::new(vec![vec![session_id("aaaa")]]);
    let h = harness(connector);

    let (tx, _rx) = mpsc::channel(100);
    let err = h
        .coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::TurnFailed(_)));
}

// Transport close after partial content still completes the turn.
#[tokio::test]
async fn transport_close_with_partial_completes() {
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        chunk("partial but real"),
    ]]);
    let h = harness(connector);

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap();

    let events = drain_until_done(&mut rx).await;
    assert!(matches!(events.last(), Some(TurnEvent::Done)));
    let messages = h.store.get_messages("aaaa").unwrap();
    assert_eq!(messages[1].content, "partial but real");
}

// Usage frames update the session's cumulative counters, including a late
// frame delivered after `done`.
#[tokio::test]
async fn usage_frames_metered_including_late() {
    let usage = |input, output| {
        Step::Emit(UpstreamEvent::Usage {
            usage: tiller_core::types::Usage {
                input_tokens: input,
                output_tokens: output,
                total_cost_usd: 0.001,
                ..Default::default()
            },
        })
    };
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        chunk("hi"),
        usage(100, 20),
        done(),
        usage(5, 1),
    ]]);
    let h = harness(connector);

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap();
    drain_until_done(&mut rx).await;

    let session = h.store.get_session("aaaa").unwrap();
    assert_eq!(session.input_tokens, 105);
    assert_eq!(session.output_tokens, 21);
}

// Enabled memory and custom instructions flow into the upstream request.
#[tokio::test]
async fn prompt_carries_memory_and_instructions() {
    let connector = ScriptedConnector::new(vec![vec![
        session_id("aaaa"),
        chunk("ok"),
        done(),
    ]]);
    let h = harness(Arc::clone(&connector));
    h.store.create_memory("likes rust", "prefers explicit errors").unwrap();
    h.store.set_setting("custom_instructions", "be terse").unwrap();
    h.store.set_setting("thinking_enabled", "true").unwrap();

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap();
    drain_until_done(&mut rx).await;

    let sent = connector.request(0);
    assert!(sent.prompt.contains("<user_memory>"));
    assert!(sent.prompt.contains("likes rust: prefers explicit errors"));
    assert!(sent.prompt.contains("## Custom instructions"));
    assert_eq!(sent.custom_instructions, "be terse");
    assert!(sent.thinking);
    assert_eq!(sent.model, ModelTier::Fast);
}

// Over-long custom instructions are rejected before anything is persisted.
#[tokio::test]
async fn oversized_custom_instructions_rejected() {
    let connector = ScriptedConnector::new(vec![]);
    let h = harness(connector);
    h.store
        .set_setting("custom_instructions", &"x".repeat(2001))
        .unwrap();

    let (tx, _rx) = mpsc::channel(100);
    let err = h
        .coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Validation(_)));
    assert_eq!(err.code(), "validation");
    assert!(h.store.get_messages("aaaa").unwrap().is_empty());
}

// A missing machine id surfaces not_found and persists nothing.
#[tokio::test]
async fn unknown_machine_rejected() {
    let connector = ScriptedConnector::new(vec![]);
    let h = harness(connector);

    let mut req = request("aaaa", "hello", true);
    req.machine_id = Some("ghost".into());
    let (tx, _rx) = mpsc::channel(100);
    let err = h.coordinator.run_turn(req, tx).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
    assert!(h.store.get_messages("aaaa").unwrap().is_empty());
}

// Title generation: second connector script answers the side-channel turn.
#[tokio::test]
async fn title_generated_after_first_exchange() {
    let connector = ScriptedConnector::new(vec![
        vec![session_id("aaaa"), chunk("Hi there"), done()],
        vec![chunk("\"Greeting the assistant\""), done()],
    ]);
    let h = harness(connector);

    let (tx, mut rx) = mpsc::channel(100);
    h.coordinator
        .run_turn(request("aaaa", "hello", true), tx)
        .await
        .unwrap();
    drain_until_done(&mut rx).await;

    // The title task is fire-and-forget; wait for its event.
    let title_event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("title event in time");
    match title_event {
        Some(TurnEvent::SessionTitle { session_id, title }) => {
            assert_eq!(session_id, "aaaa");
            assert_eq!(title, "Greeting the assistant");
        }
        other => panic!("expected session title, got {other:?}"),
    }
    assert_eq!(
        h.store.get_session("aaaa").unwrap().title.as_deref(),
        Some("Greeting the assistant")
    );
}
