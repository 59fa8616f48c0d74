//! Shared sink for errors raised inside background loops.
//!
//! Accept, read and sweep loops never propagate their per-iteration errors;
//! they hand them here and keep going.

use crate::error::ConnectionError;

pub trait ErrorObserver: Send + Sync {
    /// `origin` names the loop or flow that raised the error.
    fn report(&self, origin: &str, error: &ConnectionError);
}

/// Logs every report at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ErrorObserver for TracingObserver {
    fn report(&self, origin: &str, error: &ConnectionError) {
        tracing::error!(origin, kind = error.kind(), "{error}");
    }
}
