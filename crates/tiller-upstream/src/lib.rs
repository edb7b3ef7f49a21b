pub mod client;
pub mod error;
pub mod protocol;

pub use client::{ExecuteRequest, UpstreamClient, UpstreamConnector};
pub use error::UpstreamError;
pub use protocol::UpstreamEvent;
