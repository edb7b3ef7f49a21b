//! Drives one user turn end to end: claim the session slot, build the
//! prompt, invoke the upstream, route frames through the correlator, fan the
//! resulting events out to the client channel / persistence / usage meter,
//! and finalize on the terminal frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use tiller_core::config::{
    LATE_USAGE_GRACE_MS, MAX_CUSTOM_INSTRUCTIONS_CHARS, TURN_DEADLINE_SECS,
};
use tiller_core::types::{Attachment, ModelTier};
use tiller_store::types::Role;
use tiller_store::{Store, StoreError};
use tiller_upstream::client::{ExecuteRequest, UpstreamConnector};
use tiller_upstream::UpstreamEvent;

use crate::correlator::Correlator;
use crate::error::{Result, TurnError};
use crate::events::TurnEvent;
use crate::prompt::{build_prompt, PromptContext};
use crate::registry::{TurnHandle, TurnRegistry};
use crate::title;

/// One inbound `message` frame, already validated by the gateway.
#[derive(Debug, Clone)]
pub struct UserTurnRequest {
    pub session_id: String,
    pub content: String,
    pub model: ModelTier,
    pub attachments: Vec<Attachment>,
    pub machine_id: Option<String>,
    pub is_new_session: bool,
}

/// How the upstream event loop ended.
enum LoopEnd {
    Done,
    Cancelled,
    Failed(String),
    TransportClosed,
}

pub struct TurnCoordinator {
    store: Arc<Store>,
    registry: Arc<TurnRegistry>,
    connector: Arc<dyn UpstreamConnector>,
    workspace_path: String,
}

impl TurnCoordinator {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<TurnRegistry>,
        connector: Arc<dyn UpstreamConnector>,
        workspace_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            connector,
            workspace_path: workspace_path.into(),
        }
    }

    /// Run a full turn, streaming [`TurnEvent`]s to `events`.
    ///
    /// Returns `Err(TurnInFlight)` without side effects when the session
    /// already has an active turn. All other paths release the slot before
    /// returning.
    pub async fn run_turn(
        &self,
        req: UserTurnRequest,
        events: mpsc::Sender<TurnEvent>,
    ) -> Result<()> {
        let handle = self
            .registry
            .begin(&req.session_id)
            .ok_or(TurnError::TurnInFlight)?;

        // Deadline watchdog: fires the same cancellation trigger a client
        // cancel would, so the teardown path is identical.
        let watchdog = {
            let cancel = handle.cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(TURN_DEADLINE_SECS)).await;
                cancel.cancel();
            })
        };

        let result = self.drive(&req, &handle, &events).await;

        watchdog.abort();
        self.registry.end(&req.session_id, &handle);
        result
    }

    async fn drive(
        &self,
        req: &UserTurnRequest,
        handle: &TurnHandle,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<()> {
        // Session row: create on the new-session path, reuse on resume.
        match self.store.get_session(&req.session_id) {
            Ok(_) => {}
            Err(StoreError::NotFound { .. }) => {
                self.store.create_session(&req.session_id, req.model)?;
            }
            Err(e) => return Err(e.into()),
        }

        let custom_instructions = self
            .store
            .get_setting("custom_instructions")?
            .unwrap_or_default();
        if custom_instructions.chars().count() > MAX_CUSTOM_INSTRUCTIONS_CHARS {
            return Err(TurnError::Validation(format!(
                "custom instructions exceed {MAX_CUSTOM_INSTRUCTIONS_CHARS} characters"
            )));
        }
        let thinking = self
            .store
            .get_setting("thinking_enabled")?
            .map(|v| v == "true")
            .unwrap_or(false);

        let memory = self.store.enabled_memory()?;
        let machine = match &req.machine_id {
            Some(id) => Some(self.store.get_machine(id)?),
            None => None,
        };

        let prompt = build_prompt(&PromptContext {
            content: &req.content,
            custom_instructions: &custom_instructions,
            memory: &memory,
            attachments: &req.attachments,
            machine: machine.as_ref(),
            workspace_path: &self.workspace_path,
        });

        self.store
            .append_message(&req.session_id, Role::User, &req.content)?;

        let mut rx = self
            .connector
            .execute(
                ExecuteRequest {
                    prompt,
                    session_id: req.session_id.clone(),
                    is_new_session: req.is_new_session,
                    model: req.model,
                    custom_instructions: custom_instructions.clone(),
                    thinking,
                },
                handle.cancel.clone(),
            )
            .await?;

        let mut correlator = Correlator::new();
        let mut assistant_text = String::new();
        let mut thinking_text = String::new();
        let mut authoritative_id = req.session_id.clone();

        let end = loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => break LoopEnd::Cancelled,
                maybe = rx.recv() => {
                    let event = match maybe {
                        Some(ev) => ev,
                        None => break LoopEnd::TransportClosed,
                    };
                    match event {
                        UpstreamEvent::Error { error } => break LoopEnd::Failed(error),
                        UpstreamEvent::Done { content, session_id } => {
                            if !session_id.is_empty() {
                                authoritative_id = session_id.clone();
                            }
                            let out = correlator.handle(
                                &self.store,
                                &req.session_id,
                                UpstreamEvent::Done { content, session_id },
                            )?;
                            self.dispatch(
                                out,
                                req,
                                events,
                                &mut assistant_text,
                                &mut thinking_text,
                                &mut authoritative_id,
                            )
                            .await;
                            break LoopEnd::Done;
                        }
                        other => {
                            let out = correlator.handle(&self.store, &req.session_id, other)?;
                            self.dispatch(
                                out,
                                req,
                                events,
                                &mut assistant_text,
                                &mut thinking_text,
                                &mut authoritative_id,
                            )
                            .await;
                        }
                    }
                }
            }
        };

        if let LoopEnd::Done = end {
            // The upstream occasionally delivers usage after `done`; accept
            // stragglers briefly and attribute them to this turn.
            let grace = sleep(Duration::from_millis(LATE_USAGE_GRACE_MS));
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    _ = &mut grace => break,
                    maybe = rx.recv() => match maybe {
                        Some(UpstreamEvent::Usage { usage }) => {
                            let _ = self.store.add_usage(&req.session_id, &usage);
                            forward(events, TurnEvent::Usage { usage }).await;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }

        self.finalize(req, events, end, assistant_text, thinking_text, authoritative_id)
            .await
    }

    /// Route one batch of correlator output to its subscribers: the client
    /// channel, the text accumulators, and the usage meter.
    async fn dispatch(
        &self,
        out: Vec<TurnEvent>,
        req: &UserTurnRequest,
        events: &mpsc::Sender<TurnEvent>,
        assistant_text: &mut String,
        thinking_text: &mut String,
        authoritative_id: &mut String,
    ) {
        for event in out {
            match &event {
                TurnEvent::SessionId { session_id } => {
                    *authoritative_id = session_id.clone();
                }
                TurnEvent::AssistantDelta { content } => assistant_text.push_str(content),
                TurnEvent::ThinkingDelta { content } => thinking_text.push_str(content),
                TurnEvent::Usage { usage } => {
                    // Rows are still keyed by the original id until relink.
                    if let Err(e) = self.store.add_usage(&req.session_id, usage) {
                        warn!(error = %e, "usage update failed");
                    }
                }
                _ => {}
            }
            forward(events, event).await;
        }
    }

    async fn finalize(
        &self,
        req: &UserTurnRequest,
        events: &mpsc::Sender<TurnEvent>,
        end: LoopEnd,
        assistant_text: String,
        thinking_text: String,
        authoritative_id: String,
    ) -> Result<()> {
        match end {
            LoopEnd::Failed(error) => {
                // Keep whatever text accumulated; skip the write when empty.
                self.persist_partials(&req.session_id, &thinking_text, &assistant_text)?;
                let _ = self.store.touch_session(&req.session_id);
                Err(TurnError::TurnFailed(error))
            }

            LoopEnd::Cancelled => {
                info!(session_id = %req.session_id, "turn cancelled, persisting partial");
                self.persist_partials(&req.session_id, &thinking_text, &assistant_text)?;
                let _ = self.store.touch_session(&req.session_id);
                // No `done` event on the cancel path.
                Ok(())
            }

            LoopEnd::TransportClosed if assistant_text.is_empty() => {
                Err(TurnError::TurnFailed(
                    "upstream transport closed before any content".to_string(),
                ))
            }

            // Done, or transport loss after partial content — both complete
            // the turn with the accumulated text.
            LoopEnd::Done | LoopEnd::TransportClosed => {
                let first_reply = self.store.count_messages(&req.session_id)? == 1;
                self.persist_partials(&req.session_id, &thinking_text, &assistant_text)?;

                let session_id = if authoritative_id != req.session_id {
                    match self
                        .store
                        .relink_session(&req.session_id, &authoritative_id)
                    {
                        Ok(()) => {
                            // Re-announce the id so a client that missed the
                            // in-stream frame still converges (delivery is
                            // at-least-once, rendering is idempotent).
                            forward(
                                events,
                                TurnEvent::SessionId {
                                    session_id: authoritative_id.clone(),
                                },
                            )
                            .await;
                            authoritative_id
                        }
                        Err(StoreError::Conflict { .. }) => {
                            warn!(
                                old = %req.session_id,
                                new = %authoritative_id,
                                "relink target exists, keeping original id"
                            );
                            req.session_id.clone()
                        }
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    let _ = self
                        .store
                        .set_claude_session_id(&req.session_id, &authoritative_id);
                    req.session_id.clone()
                };

                if first_reply && !assistant_text.is_empty() {
                    self.spawn_title_task(
                        session_id.clone(),
                        req.content.clone(),
                        assistant_text,
                        events.clone(),
                    );
                }

                self.store.touch_session(&session_id)?;
                forward(events, TurnEvent::Done).await;
                Ok(())
            }
        }
    }

    fn persist_partials(
        &self,
        session_id: &str,
        thinking_text: &str,
        assistant_text: &str,
    ) -> Result<()> {
        if !thinking_text.is_empty() {
            self.store
                .append_message(session_id, Role::Thinking, thinking_text)?;
        }
        if !assistant_text.is_empty() {
            self.store
                .append_message(session_id, Role::Assistant, assistant_text)?;
        }
        Ok(())
    }

    /// Fire-and-forget title generation after the first exchange.
    fn spawn_title_task(
        &self,
        session_id: String,
        user_text: String,
        assistant_text: String,
        events: mpsc::Sender<TurnEvent>,
    ) {
        let connector = Arc::clone(&self.connector);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Some(title) = title::generate_title(
                connector,
                store,
                session_id.clone(),
                user_text,
                assistant_text,
            )
            .await
            {
                let _ = events
                    .send(TurnEvent::SessionTitle { session_id, title })
                    .await;
            }
        });
    }
}

/// Send one event to the client channel.
///
/// `tool_progress` is informational and dropped when the buffer is full; all
/// other events await, which back-pressures the correlator and, through it,
/// the upstream reader.
async fn forward(events: &mpsc::Sender<TurnEvent>, event: TurnEvent) {
    if matches!(event, TurnEvent::ToolProgress { .. }) {
        let _ = events.try_send(event);
    } else {
        let _ = events.send(event).await;
    }
}
