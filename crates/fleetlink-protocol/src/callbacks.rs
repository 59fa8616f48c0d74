//! Append-only callback lists, one per owning instance.

use std::sync::{Arc, Mutex};

pub type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Handlers run in registration order. The list is snapshotted before
/// firing, so a handler may register further handlers without deadlocking.
pub struct Callbacks<A> {
    handlers: Mutex<Vec<Callback<A>>>,
}

impl<A> Default for Callbacks<A> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<A> std::fmt::Debug for Callbacks<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").field("len", &self.len()).finish()
    }
}

impl<A> Callbacks<A> {
    pub fn register(&self, handler: impl Fn(&A) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(handler));
    }

    pub fn fire(&self, arg: &A) {
        let snapshot: Vec<Callback<A>> = self
            .handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for handler in snapshot {
            handler(arg);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
