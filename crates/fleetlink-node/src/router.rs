//! Event router -- dispatches inbound Messages to handlers by message type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleetlink_protocol::{Data, Message, MessageError};
use tokio::sync::RwLock;

use crate::connection::Connection;

/// Handles inbound Messages of one type. The returned data becomes the
/// reply's payload; an error is attached to the reply instead.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, conn: &Connection, message: &Message) -> Result<Data, MessageError>;
}

/// Adapter for plain closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Connection, &Message) -> Result<Data, MessageError> + Send + Sync,
{
    async fn handle(&self, conn: &Connection, message: &Message) -> Result<Data, MessageError> {
        (self.0)(conn, message)
    }
}

#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub async fn register(&self, kind: &str, handler: Arc<dyn EventHandler>) {
        let replaced = self
            .handlers
            .write()
            .await
            .insert(kind.to_string(), handler)
            .is_some();
        if replaced {
            tracing::warn!(kind, "router: handler replaced");
        } else {
            tracing::debug!(kind, "router: handler registered");
        }
    }

    pub async fn has_handler(&self, kind: &str) -> bool {
        self.handlers.read().await.contains_key(kind)
    }

    /// Run the matching handler and build the reply.
    pub async fn dispatch(&self, conn: &Connection, message: &Message) -> Message {
        let handler = self.handlers.read().await.get(&message.kind).cloned();
        let mut reply = message.reply();
        match handler {
            None => {
                tracing::warn!(
                    kind = %message.kind,
                    public_id = conn.public_id().unwrap_or("-"),
                    "router: no handler for message type"
                );
                reply.add_error(MessageError::code("unknown_message_type"));
            }
            Some(handler) => match handler.handle(conn, message).await {
                Ok(data) => reply.data = data,
                Err(error) => reply.add_error(error),
            },
        }
        reply
    }
}
