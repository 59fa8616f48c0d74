//! Fleetlink Protocol -- wire frames, message envelopes, envelope codec.
//!
//! TCP between the bot and each game server. 4-byte big-endian length prefix
//! + envelope. The envelope is plaintext JSON until the peer identifies, then
//! gzip-compressed JSON sealed by `fleetlink-crypto`.

pub mod callbacks;
pub mod codec;
pub mod frame;
pub mod message;
pub mod promise;
pub mod request;
pub mod schema;

pub use callbacks::Callbacks;
pub use codec::EnvelopeCodec;
pub use message::{ErrorKind, Message, MessageError, SAFETY_TIMEOUT};
pub use promise::{Outcome, Promise, Rejection};
pub use request::{Request, RequestId, RequestType};
pub use schema::{Data, Metadata};

/// Maximum envelope size: 16 MB.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid request id {0:?}: expected 32 hex characters")]
    InvalidRequestId(String),
    #[error("unknown request type code {0}")]
    UnknownRequestType(u8),
    #[error("envelope too large: {size} bytes (max {max})")]
    EnvelopeTooLarge { size: usize, max: usize },
    #[error("schema violation: {0}")]
    Schema(String),
    #[error("message carries errors: {}", join_errors(.0))]
    MessageErrors(Vec<MessageError>),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] fleetlink_crypto::CryptoError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[MessageError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
