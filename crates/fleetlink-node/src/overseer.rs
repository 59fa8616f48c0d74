//! Message overseer -- fails outbound Messages nobody answered in time.
//!
//! Holds `message id → (message, expires_at)` under one lock. The sweep pulls
//! expired entries out while holding it and fires their `on_error` handlers
//! only after it is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetlink_protocol::{Message, MessageError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Watched {
    message: Message,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MessageOverseer {
    mailbox: Mutex<HashMap<Uuid, Watched>>,
}

impl MessageOverseer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Watched>> {
        self.mailbox.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn watch(&self, message: Message, expires_at: Instant) {
        self.lock().insert(message.id, Watched { message, expires_at });
    }

    pub fn retrieve(&self, id: &Uuid) -> Option<Message> {
        self.lock().get(id).map(|w| w.message.clone())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Message> {
        self.lock().remove(id).map(|w| w.message)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail every expired, undelivered message. Returns how many were failed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Message> = {
            let mut mailbox = self.lock();
            let ids: Vec<Uuid> = mailbox
                .iter()
                .filter(|(_, w)| w.expires_at <= now || w.message.is_delivered())
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| mailbox.remove(id))
                .map(|w| w.message)
                .filter(|m| !m.is_delivered())
                .collect()
        };

        let mut failed = 0;
        for mut message in expired {
            if message.fail([MessageError::undeliverable()]) {
                tracing::warn!(
                    message_id = %message.id,
                    kind = %message.kind,
                    server_id = message.server_id.as_deref().unwrap_or("-"),
                    "overseer: message undeliverable"
                );
                failed += 1;
            }
        }
        failed
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        tracing::debug!("overseer: stopped");
    }
}
