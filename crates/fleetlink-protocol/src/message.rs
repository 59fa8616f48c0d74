//! Message -- the application envelope carried inside `message` frames.
//!
//! Wire form:
//! `{"id","server_id","type","data":{"type","content"},"metadata":{..},"errors":[..]}`
//! with `server_id` as a byte array. Delivery state (the one-way `delivered`
//! flag and the callback lists) is not serialised and is shared between
//! clones, so the copy held by the overseer and the caller's copy agree.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::callbacks::Callbacks;
use crate::promise::{Promise, Rejection};
use crate::schema::{Data, Metadata};
use crate::ProtocolError;

/// Upper bound for `Message::wait_for_response`, whatever else happens.
pub const SAFETY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Machine-readable code, translated for humans by the caller.
    Code,
    /// Free text.
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub content: String,
}

impl MessageError {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Code,
            content: code.into(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Message,
            content: text.into(),
        }
    }

    pub fn undeliverable() -> Self {
        Self::code("undeliverable")
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Code => write!(f, "[{}]", self.content),
            ErrorKind::Message => f.write_str(&self.content),
        }
    }
}

#[derive(Default)]
struct Delivery {
    delivered: Mutex<bool>,
    on_response: Callbacks<Message>,
    on_error: Callbacks<Message>,
    waiter: OnceLock<Promise<Message>>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub id: Uuid,
    #[serde(default, with = "server_id_bytes")]
    pub server_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub errors: Vec<MessageError>,
    #[serde(skip)]
    delivery: Arc<Delivery>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("kind", &self.kind)
            .field("data", &self.data)
            .field("metadata", &self.metadata)
            .field("errors", &self.errors)
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

/// Equality over the wire fields only.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.server_id == other.server_id
            && self.kind == other.kind
            && self.data == other.data
            && self.metadata == other.metadata
            && self.errors == other.errors
    }
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id: None,
            kind: kind.into(),
            data: Data::Empty,
            metadata: Metadata::Empty,
            errors: Vec::new(),
            delivery: Arc::default(),
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn add_error(&mut self, error: MessageError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Parse and validate against the static schemas.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Schema(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Turn a message carrying errors into `ProtocolError::MessageErrors`.
    pub fn into_result(self) -> Result<Self, ProtocolError> {
        if self.has_errors() {
            return Err(ProtocolError::MessageErrors(self.errors));
        }
        Ok(self)
    }

    /// A response to this message: same id, type and server, fresh delivery state.
    pub fn reply(&self) -> Self {
        Self {
            id: self.id,
            server_id: self.server_id.clone(),
            kind: self.kind.clone(),
            data: Data::Empty,
            metadata: Metadata::Empty,
            errors: Vec::new(),
            delivery: Arc::default(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        *self
            .delivery
            .delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flip `delivered`. Returns true only for the caller that flipped it.
    pub fn mark_delivered(&self) -> bool {
        let mut delivered = self
            .delivery
            .delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *delivered {
            return false;
        }
        *delivered = true;
        true
    }

    pub fn on_response(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.delivery.on_response.register(handler);
    }

    pub fn on_error(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.delivery.on_error.register(handler);
    }

    /// Hand the peer's reply to the `on_response` handlers. No-op once delivered.
    pub fn deliver(&self, reply: &Message) -> bool {
        if !self.mark_delivered() {
            return false;
        }
        self.delivery.on_response.fire(reply);
        true
    }

    /// Record `errors` and fire the `on_error` handlers. No-op once delivered.
    pub fn fail(&mut self, errors: impl IntoIterator<Item = MessageError>) -> bool {
        if !self.mark_delivered() {
            return false;
        }
        self.errors.extend(errors);
        self.delivery.on_error.fire(self);
        true
    }

    /// Route both outcomes into a promise for `wait_for_response`.
    /// Call before the message is sent.
    pub fn synchronous(&self) -> Promise<Message> {
        let mut fresh = false;
        let promise = self
            .delivery
            .waiter
            .get_or_init(|| {
                fresh = true;
                Promise::new()
            })
            .clone();

        if fresh {
            let on_response = promise.clone();
            self.on_response(move |reply| {
                on_response.fulfil(reply.clone());
            });
            let on_error = promise.clone();
            self.on_error(move |failed| {
                on_error.reject(Rejection::Errors(failed.errors.clone()));
            });
        }
        promise
    }

    pub async fn wait_for_response(&self) -> Result<Message, Rejection> {
        self.wait_for_response_within(SAFETY_TIMEOUT).await
    }

    pub async fn wait_for_response_within(&self, timeout: Duration) -> Result<Message, Rejection> {
        let promise = self.synchronous();
        promise
            .wait(timeout.min(SAFETY_TIMEOUT))
            .await
            .into_result()
    }
}

/// `server_id` travels as an array of bytes; a plain string is accepted too.
mod server_id_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(id) => serializer.collect_seq(id.as_bytes()),
            None => serializer.serialize_none(),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(Vec<u8>),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Text(text)) => Ok(Some(text)),
            Some(Raw::Bytes(bytes)) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("server_id is not utf-8: {e}"))),
        }
    }
}
