//! Request -- the fixed three-field wire frame.
//!
//! Serialised with short keys: `{"i": id, "t": type code, "c": [bytes]}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtocolError;

const REQUEST_ID_LENGTH: usize = 32;

/// Closed type table shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    Noop = 0,
    Error = 1,
    Identification = 2,
    Handshake = 3,
    Initialize = 4,
    Message = 5,
}

impl RequestType {
    pub const ALL: [RequestType; 6] = [
        RequestType::Noop,
        RequestType::Error,
        RequestType::Identification,
        RequestType::Handshake,
        RequestType::Initialize,
        RequestType::Message,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            RequestType::Noop => "noop",
            RequestType::Error => "error",
            RequestType::Identification => "identification",
            RequestType::Handshake => "handshake",
            RequestType::Initialize => "initialize",
            RequestType::Message => "message",
        }
    }
}

impl TryFrom<u8> for RequestType {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, ProtocolError> {
        RequestType::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or(ProtocolError::UnknownRequestType(code))
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 32 lowercase hex characters (a v4 UUID without dashes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(id: &str) -> Result<Self, ProtocolError> {
        if id.len() != REQUEST_ID_LENGTH || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidRequestId(id.to_string()));
        }
        Ok(Self(id.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RequestId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireRequest", into = "WireRequest")]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestType,
    pub content: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    i: String,
    t: u8,
    #[serde(default)]
    c: Option<Vec<u8>>,
}

impl TryFrom<WireRequest> for Request {
    type Error = ProtocolError;

    fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            id: RequestId::parse(&wire.i)?,
            kind: RequestType::try_from(wire.t)?,
            content: wire.c.unwrap_or_default(),
        })
    }
}

impl From<Request> for WireRequest {
    fn from(request: Request) -> Self {
        Self {
            i: request.id.0,
            t: request.kind.code(),
            c: Some(request.content),
        }
    }
}

impl Request {
    /// New request with a freshly generated id.
    pub fn new(kind: RequestType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: RequestId::generate(),
            kind,
            content: content.into(),
        }
    }

    pub fn with_id(id: &str, kind: RequestType, content: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: RequestId::parse(id)?,
            kind,
            content: content.into(),
        })
    }

    /// A frame answering this one: same id, new type and content.
    pub fn reply(&self, kind: RequestType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: self.id.clone(),
            kind,
            content: content.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame as sent by the peer.
    pub fn from_client(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireRequest = serde_json::from_slice(bytes)?;
        Self::try_from(wire)
    }

    /// Content as text, for logging and error payloads.
    pub fn content_lossy(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}
