//! Fleetlink Node -- connection server for a fleet of game servers.
//!
//! Re-exports the connection, manager, server and overseer modules so the
//! binary, integration tests and the bot's other services share one API.

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod observer;
pub mod overseer;
pub mod router;
pub mod server;
pub mod session;
pub mod worker_pool;

use std::path::PathBuf;

pub use connection::{Connection, ConnectionState, PendingRequest, ServerInfo};
pub use directory::{Credentials, ServerDirectory, StaticDirectory};
pub use error::ConnectionError;
pub use observer::{ErrorObserver, TracingObserver};
pub use router::{EventHandler, FnHandler};
pub use server::ConnectionServer;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
