//! Promise -- a write-once result slot with a bounded wait.
//!
//! Backed by a `tokio::sync::watch` channel holding `Option<Outcome<T>>`.
//! The first `fulfil`/`reject` wins; later attempts return `false` and change
//! nothing. `wait` never errors: running out of time is itself an outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::message::MessageError;

/// Why a promise was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Nothing arrived before the deadline.
    Timeout,
    /// The owning connection closed first.
    Closed,
    /// The peer answered with an error frame.
    Peer(String),
    /// The request never made it onto the wire.
    Transport(String),
    /// A message failed with application-level errors.
    Errors(Vec<MessageError>),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Timeout => f.write_str("timed out"),
            Rejection::Closed => f.write_str("connection closed"),
            Rejection::Peer(reason) => write!(f, "peer rejected: {reason}"),
            Rejection::Transport(reason) => write!(f, "transport failure: {reason}"),
            Rejection::Errors(errors) => {
                let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                write!(f, "message errors: {}", joined.join("; "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Fulfilled(T),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Outcome::Fulfilled(_))
    }

    pub fn into_result(self) -> Result<T, Rejection> {
        match self {
            Outcome::Fulfilled(value) => Ok(value),
            Outcome::Rejected(reason) => Err(reason),
        }
    }
}

pub struct Promise<T> {
    slot: Arc<watch::Sender<Option<Outcome<T>>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.slot.borrow().is_some())
            .finish()
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Resolve once. Returns false if the promise was already resolved.
    pub fn resolve(&self, outcome: Outcome<T>) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub fn fulfil(&self, value: T) -> bool {
        self.resolve(Outcome::Fulfilled(value))
    }

    pub fn reject(&self, reason: Rejection) -> bool {
        self.resolve(Outcome::Rejected(reason))
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Current outcome without waiting.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.slot.borrow().clone()
    }

    /// Wait for the outcome. On timeout the promise itself is rejected with
    /// `Rejection::Timeout`, unless a resolution raced in first.
    pub async fn wait(&self, timeout: Duration) -> Outcome<T> {
        let mut rx = self.slot.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(Option::is_some).await.map(|slot| slot.clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) | Ok(Err(_)) => Outcome::Rejected(Rejection::Closed),
            Err(_) => {
                self.reject(Rejection::Timeout);
                self.peek()
                    .unwrap_or(Outcome::Rejected(Rejection::Timeout))
            }
        }
    }
}
