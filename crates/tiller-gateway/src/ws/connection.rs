//! Per-browser WebSocket connection handling.
//!
//! Each connection gets a dedicated writer task fed by a bounded channel —
//! that channel is the per-connection write lock: every outbound frame goes
//! through it, so writes never interleave. The reader loop demultiplexes
//! inbound frames into turn tasks and cancellations.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tiller_core::config::{MAX_PAYLOAD_BYTES, OUTBOUND_BUFFER};
use tiller_turn::{TurnEvent, UserTurnRequest};

use crate::app::AppState;
use crate::ws::frames::{ClientRequest, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    key: Option<String>,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws.
///
/// When a gateway key is configured the upgrade is refused without it; the
/// socket never opens for unauthorized peers.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(expected) = &state.config.gateway_key {
        if query.key.as_deref() != Some(expected.as_str()) {
            warn!("ws upgrade rejected: bad or missing key");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

/// Per-connection task — lives for the entire WS session lifetime.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "new client connection");

    let (mut sink, mut stream) = socket.split();

    // Writer task — the single writer for this socket.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(json) = out_rx.recv().await {
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    state.ws_clients.insert(conn_id.clone(), out_tx.clone());

    // Sessions this connection started turns on; cancelled on disconnect.
    let mut sessions_started: HashSet<String> = HashSet::new();

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_PAYLOAD_BYTES {
                    warn!(conn_id, size = text.len(), "payload too large, closing");
                    break;
                }
                handle_frame(&text, &state, &out_tx, &mut sessions_started).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.ws_clients.remove(&conn_id);
    for session_id in &sessions_started {
        state.registry.cancel(session_id);
    }
    writer.abort();
    info!(conn_id, "client connection closed");
}

/// Handle one inbound text frame.
async fn handle_frame(
    text: &str,
    state: &Arc<AppState>,
    out_tx: &mpsc::Sender<String>,
    sessions_started: &mut HashSet<String>,
) {
    let frame: ClientRequest = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "malformed client frame");
            let _ = out_tx
                .send(ServerEvent::error("validation", format!("bad frame: {e}")).to_json())
                .await;
            return;
        }
    };

    match frame {
        ClientRequest::Message {
            session_id,
            content,
            model,
            attachments,
            machine_id,
            is_new_session,
        } => {
            sessions_started.insert(session_id.clone());
            let request = UserTurnRequest {
                session_id,
                content,
                model,
                attachments,
                machine_id,
                is_new_session,
            };
            spawn_turn(state, request, out_tx.clone());
        }

        ClientRequest::Cancel { session_id } => {
            info!(session_id, "client requested cancel");
            state.registry.cancel(&session_id);
        }
    }
}

/// Run one turn in the background, bridging its events onto the connection's
/// writer channel.
fn spawn_turn(state: &Arc<AppState>, request: UserTurnRequest, out_tx: mpsc::Sender<String>) {
    let coordinator = Arc::clone(&state.coordinator);
    let (event_tx, mut event_rx) = mpsc::channel::<TurnEvent>(OUTBOUND_BUFFER);

    // Bridge: turn events → wire frames, in emission order.
    let bridge_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let json = ServerEvent::from(event).to_json();
            if bridge_out.send(json).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        if let Err(e) = coordinator.run_turn(request, event_tx).await {
            let _ = out_tx
                .send(ServerEvent::error(e.code(), e.to_string()).to_json())
                .await;
        }
    });
}
