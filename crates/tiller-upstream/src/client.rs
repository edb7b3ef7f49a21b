//! WebSocket client for the upstream agent.
//!
//! A fresh connection is opened per turn: connect (with retries), send one
//! `execute` frame, then forward inbound frames as [`UpstreamEvent`]s until
//! a terminal frame, cancellation, or transport close.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tiller_core::config::{CONNECT_ATTEMPTS, LATE_USAGE_GRACE_MS, OUTBOUND_BUFFER};
use tiller_core::types::ModelTier;

use crate::error::{Result, UpstreamError};
use crate::protocol::{OutboundFrame, UpstreamEvent};

/// Everything needed to start one turn against the upstream.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub session_id: String,
    pub is_new_session: bool,
    pub model: ModelTier,
    pub custom_instructions: String,
    pub thinking: bool,
}

/// The seam between the turn coordinator and the wire.
///
/// Production uses [`UpstreamClient`]; tests script the frame sequence.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a connection, send the execute frame, and return the event
    /// stream. The receiver closes on `done`, `error`, cancellation, or
    /// transport close — it is finite and non-restartable.
    async fn execute(
        &self,
        req: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<UpstreamEvent>>;
}

/// Production connector talking WebSocket to the configured upstream.
pub struct UpstreamClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    /// The WS endpoint derived from the configured base URL.
    fn ws_url(&self) -> Result<String> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if self.base_url.starts_with("ws://") || self.base_url.starts_with("wss://") {
            self.base_url.clone()
        } else {
            return Err(UpstreamError::Url(self.base_url.clone()));
        };
        Ok(format!("{ws_base}/ws"))
    }

    /// Probe the upstream's unauthenticated health endpoint.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Transport(format!(
                "health check returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Connect with up to [`CONNECT_ATTEMPTS`] tries and linear backoff
    /// (1s, 2s) between failures.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let mut last = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            let mut request = url
                .into_client_request()
                .map_err(|e| UpstreamError::Url(e.to_string()))?;
            if let Some(key) = &self.api_key {
                let value = HeaderValue::from_str(key)
                    .map_err(|e| UpstreamError::Url(e.to_string()))?;
                request.headers_mut().insert("X-API-Key", value);
            }

            match tokio_tungstenite::connect_async(request).await {
                Ok((ws, _response)) => {
                    debug!(url, attempt, "upstream connected");
                    return Ok(ws);
                }
                Err(e) => {
                    last = e.to_string();
                    warn!(url, attempt, error = %last, "upstream connect failed");
                    if attempt < CONNECT_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }
        Err(UpstreamError::Connect {
            attempts: CONNECT_ATTEMPTS,
            last,
        })
    }
}

#[async_trait]
impl UpstreamConnector for UpstreamClient {
    async fn execute(
        &self,
        req: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<UpstreamEvent>> {
        let url = self.ws_url()?;
        let mut ws = self.connect(&url).await?;

        let frame = OutboundFrame::Execute {
            prompt: req.prompt,
            session_id: req.session_id,
            is_new_session: req.is_new_session,
            model: req.model,
            custom_instructions: req.custom_instructions,
            thinking: req.thinking,
        };
        let json = serde_json::to_string(&frame)?;
        ws.send(Message::Text(json))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);

        // Reader task — owns the socket for the rest of the turn. Frames are
        // forwarded in arrival order; the bounded channel is the only buffer,
        // so a slow consumer back-pressures the socket read.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("turn cancelled, closing upstream transport");
                        let _ = ws.close(None).await;
                        break;
                    }
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let event: UpstreamEvent = match serde_json::from_str(&text) {
                                    Ok(ev) => ev,
                                    Err(e) => {
                                        // Tolerant decode: drop the frame,
                                        // keep the stream alive.
                                        warn!(error = %e, "undecodable upstream frame, dropping");
                                        continue;
                                    }
                                };
                                let terminal = matches!(
                                    event,
                                    UpstreamEvent::Done { .. } | UpstreamEvent::Error { .. }
                                );
                                if tx.send(event).await.is_err() {
                                    break; // receiver dropped
                                }
                                if terminal {
                                    // The upstream sometimes delivers a usage
                                    // frame just after `done`; linger briefly
                                    // so it can be attributed to this turn.
                                    drain_late_usage(&mut ws, &tx).await;
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("upstream closed transport");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "upstream transport error");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Forward any `usage` frames that arrive within the post-terminal grace
/// window; everything else is ignored.
async fn drain_late_usage(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tx: &tokio::sync::mpsc::Sender<UpstreamEvent>,
) {
    let deadline = tokio::time::sleep(Duration::from_millis(LATE_USAGE_GRACE_MS));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(event @ UpstreamEvent::Usage { .. }) =
                        serde_json::from_str(&text)
                    {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_from_http_base() {
        let c = UpstreamClient::new("http://localhost:9100", None);
        assert_eq!(c.ws_url().unwrap(), "ws://localhost:9100/ws");
    }

    #[test]
    fn ws_url_from_https_base_strips_trailing_slash() {
        let c = UpstreamClient::new("https://agent.example.com/", None);
        assert_eq!(c.ws_url().unwrap(), "wss://agent.example.com/ws");
    }

    #[test]
    fn ws_url_passthrough_for_ws_scheme() {
        let c = UpstreamClient::new("ws://10.0.0.2:9100", None);
        assert_eq!(c.ws_url().unwrap(), "ws://10.0.0.2:9100/ws");
    }

    #[test]
    fn ws_url_rejects_unknown_scheme() {
        let c = UpstreamClient::new("ftp://nope", None);
        assert!(matches!(c.ws_url(), Err(UpstreamError::Url(_))));
    }
}
