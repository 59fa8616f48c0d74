//! Error taxonomy for the connection subsystem.

use std::time::Duration;

use fleetlink_protocol::{ProtocolError, Rejection};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("decryption failed")]
    Decryption,
    #[error("request {request_id} timed out after {timeout:?}")]
    RequestTimeout { request_id: String, timeout: Duration },
    #[error("request rejected by peer: {0}")]
    RejectedRequest(String),
    #[error("protocol error: {0}")]
    Protocol(#[source] ProtocolError),
    #[error("message {message_id} undeliverable to {public_id}")]
    Undeliverable { public_id: String, message_id: Uuid },
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

impl From<ProtocolError> for ConnectionError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Crypto(_) => ConnectionError::Decryption,
            ProtocolError::Io(e) => ConnectionError::Io(e),
            other => ConnectionError::Protocol(other),
        }
    }
}

impl From<serde_json::Error> for ConnectionError {
    fn from(error: serde_json::Error) -> Self {
        ConnectionError::Protocol(ProtocolError::Json(error))
    }
}

impl ConnectionError {
    /// Raise a promise rejection at a blocking call site.
    pub fn from_rejection(rejection: Rejection, request_id: &str, timeout: Duration) -> Self {
        match rejection {
            Rejection::Timeout => ConnectionError::RequestTimeout {
                request_id: request_id.to_string(),
                timeout,
            },
            Rejection::Closed => ConnectionError::Closed,
            Rejection::Peer(reason) => ConnectionError::RejectedRequest(reason),
            Rejection::Transport(reason) => ConnectionError::Transport(reason),
            Rejection::Errors(errors) => {
                ConnectionError::Protocol(ProtocolError::MessageErrors(errors))
            }
        }
    }

    /// Short tag for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::Authentication(_) => "authentication",
            ConnectionError::Decryption => "decryption",
            ConnectionError::RequestTimeout { .. } => "request_timeout",
            ConnectionError::RejectedRequest(_) => "rejected_request",
            ConnectionError::Protocol(_) => "protocol",
            ConnectionError::Undeliverable { .. } => "undeliverable",
            ConnectionError::Closed => "closed",
            ConnectionError::Transport(_) => "transport",
            ConnectionError::Io(_) => "io",
        }
    }
}
