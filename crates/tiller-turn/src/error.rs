use thiserror::Error;

use tiller_store::StoreError;
use tiller_upstream::UpstreamError;

/// Errors surfaced by a turn.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The session already has an active turn; no queueing.
    #[error("session already has an active turn")]
    TurnInFlight,

    /// The upstream reported a terminal error, or the transport closed
    /// before any content arrived.
    #[error("turn failed: {0}")]
    TurnFailed(String),

    /// A request parameter was outside its allowed range.
    #[error("validation error: {0}")]
    Validation(String),

    /// The upstream was unreachable.
    #[error(transparent)]
    Transport(#[from] UpstreamError),

    /// Persistence failed mid-turn.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TurnError {
    /// Stable code string sent to clients in outbound `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            TurnError::TurnInFlight => "busy",
            TurnError::TurnFailed(_) => "turn_failed",
            TurnError::Validation(_) => "validation",
            TurnError::Transport(_) => "transport",
            TurnError::Store(StoreError::NotFound { .. }) => "not_found",
            TurnError::Store(StoreError::Conflict { .. }) => "conflict",
            TurnError::Store(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, TurnError>;
