//! Session title generation — a short side-channel turn on the fastest tier
//! after the first exchange completes. Fire-and-forget: failures leave the
//! title empty and never disturb the main turn.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use tiller_core::config::{TITLE_MAX_CHARS, TITLE_TIMEOUT_SECS};
use tiller_core::types::ModelTier;
use tiller_store::{Store, StoreError};
use tiller_upstream::client::{ExecuteRequest, UpstreamConnector};
use tiller_upstream::UpstreamEvent;

const EXCERPT_CHARS: usize = 500;

/// Ask the upstream to summarize the first exchange and persist the result.
///
/// Returns the stored title, or `None` when generation failed or the session
/// was deleted in the meantime (a benign race — the update is skipped).
pub async fn generate_title(
    connector: Arc<dyn UpstreamConnector>,
    store: Arc<Store>,
    session_id: String,
    user_text: String,
    assistant_text: String,
) -> Option<String> {
    let prompt = format!(
        "Summarize this exchange as a conversation title in the language of \
         the exchange. Reply with the title only — no quotes, at most 40 \
         characters.\n\nUser: {}\nAssistant: {}",
        excerpt(&user_text),
        excerpt(&assistant_text),
    );

    let request = ExecuteRequest {
        prompt,
        session_id: Uuid::new_v4().to_string(),
        is_new_session: true,
        model: ModelTier::Fast,
        custom_instructions: String::new(),
        thinking: false,
    };

    let cancel = CancellationToken::new();
    let raw = tokio::time::timeout(
        Duration::from_secs(TITLE_TIMEOUT_SECS),
        collect_text(connector, request, cancel.clone()),
    )
    .await;
    // A timed-out generation should not leave the upstream socket open.
    cancel.cancel();

    let title = match raw {
        Ok(Some(text)) => clean_title(&text),
        Ok(None) => {
            debug!(session_id, "title generation produced no text");
            return None;
        }
        Err(_) => {
            debug!(session_id, "title generation timed out");
            return None;
        }
    };
    if title.is_empty() {
        return None;
    }

    match store.update_session_title(&session_id, &title) {
        Ok(()) => Some(title),
        // The session was deleted while we were generating; nothing to do.
        Err(StoreError::NotFound { .. }) => None,
        Err(e) => {
            warn!(session_id, error = %e, "failed to persist title");
            None
        }
    }
}

async fn collect_text(
    connector: Arc<dyn UpstreamConnector>,
    request: ExecuteRequest,
    cancel: CancellationToken,
) -> Option<String> {
    let mut rx = match connector.execute(request, cancel).await {
        Ok(rx) => rx,
        Err(e) => {
            debug!(error = %e, "title turn failed to start");
            return None;
        }
    };

    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            UpstreamEvent::Chunk { content } => text.push_str(&content),
            UpstreamEvent::Done { content, .. } => {
                if text.is_empty() {
                    text = content;
                }
                break;
            }
            UpstreamEvent::Error { error } => {
                debug!(error, "title turn errored");
                return None;
            }
            _ => {}
        }
    }

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Normalize a model-produced title: trim, strip wrapping quotes, and cap
/// the length with an ellipsis.
fn clean_title(raw: &str) -> String {
    let mut title = raw.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('“', '”')] {
        if title.len() >= 2 && title.starts_with(open) && title.ends_with(close) {
            title = &title[open.len_utf8()..title.len() - close.len_utf8()];
            title = title.trim();
        }
    }

    let chars: Vec<char> = title.chars().collect();
    if chars.len() > TITLE_MAX_CHARS {
        let mut truncated: String = chars[..TITLE_MAX_CHARS - 1].iter().collect();
        truncated.push('…');
        truncated
    } else {
        title.to_string()
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
