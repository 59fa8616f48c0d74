//! Ledger -- request id → promise for every request awaiting a response.
//!
//! An entry lives from send until its response is matched, it is dropped
//! (timeout), or the connection closes. Recently finished ids are remembered
//! so a late or duplicate response is recognised and dropped instead of being
//! treated as a new inbound request.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use fleetlink_protocol::{Outcome, Promise, Rejection, Request, RequestId};

/// How many finished ids are remembered for duplicate detection.
const COMPLETED_MEMORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Matched a pending request; its promise is now resolved.
    Resolved,
    /// The id was already finished. Nothing changed.
    Duplicate,
    /// Not a response to anything we sent.
    Unknown,
}

#[derive(Debug, Default)]
struct Entries {
    pending: HashMap<RequestId, Promise<Vec<u8>>>,
    finished: HashSet<RequestId>,
    finished_order: VecDeque<RequestId>,
}

impl Entries {
    fn remember(&mut self, id: RequestId) {
        if self.finished.insert(id.clone()) {
            self.finished_order.push_back(id);
        }
        while self.finished_order.len() > COMPLETED_MEMORY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    entries: Mutex<Entries>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a fresh promise for `request`.
    pub fn add(&self, request: &Request) -> Promise<Vec<u8>> {
        let promise = Promise::new();
        self.lock().pending.insert(request.id.clone(), promise.clone());
        promise
    }

    /// Detach an entry without resolving it.
    pub fn remove(&self, id: &RequestId) -> Option<Promise<Vec<u8>>> {
        let mut entries = self.lock();
        let removed = entries.pending.remove(id);
        if removed.is_some() {
            entries.remember(id.clone());
        }
        removed
    }

    pub fn resolve(&self, id: &RequestId, outcome: Outcome<Vec<u8>>) -> Resolution {
        let promise = {
            let mut entries = self.lock();
            match entries.pending.remove(id) {
                Some(promise) => {
                    entries.remember(id.clone());
                    promise
                }
                None if entries.finished.contains(id) => return Resolution::Duplicate,
                None => return Resolution::Unknown,
            }
        };
        promise.resolve(outcome);
        Resolution::Resolved
    }

    /// Reject and drop every pending entry. Returns how many there were.
    pub fn reject_all(&self, reason: Rejection) -> usize {
        let drained: Vec<(RequestId, Promise<Vec<u8>>)> = {
            let mut entries = self.lock();
            let drained: Vec<_> = entries.pending.drain().collect();
            for (id, _) in &drained {
                entries.remember(id.clone());
            }
            drained
        };
        for (_, promise) in &drained {
            promise.reject(reason.clone());
        }
        drained.len()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
