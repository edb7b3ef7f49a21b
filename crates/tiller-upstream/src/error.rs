use thiserror::Error;

/// Errors from the upstream channel.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// All connect attempts failed.
    #[error("upstream unreachable after {attempts} attempts: {last}")]
    Connect { attempts: u32, last: String },

    /// The configured base URL could not be turned into a WS address.
    #[error("invalid upstream url: {0}")]
    Url(String),

    /// The transport dropped mid-stream.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// Serializing the outbound frame failed.
    #[error("frame encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, UpstreamError>;
