//! Server directory -- credential and settings lookup for connecting peers.
//!
//! The bot's persistence layer implements `ServerDirectory`; `StaticDirectory`
//! serves the `[[servers]]` entries of the node config.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use fleetlink_crypto::{key_from_hex, NonceLayout, KEY_LENGTH};
use fleetlink_protocol::schema::PostInitData;

use crate::config::ServerEntry;

/// What a peer must prove it knows, plus the layout it starts with.
#[derive(Clone)]
pub struct Credentials {
    pub server_id: String,
    pub key: [u8; KEY_LENGTH],
    pub layout: NonceLayout,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server_id", &self.server_id)
            .field("key", &"<redacted>")
            .field("layout", &self.layout)
            .finish()
    }
}

#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// Credentials for a public id, or `None` if the id is unknown.
    async fn credentials(&self, public_id: &str) -> Option<Credentials>;

    /// Settings pushed to the server during initialization.
    async fn settings(&self, server_id: &str) -> Option<PostInitData>;
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    credentials: HashMap<String, Credentials>,
    settings: HashMap<String, PostInitData>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[ServerEntry]) -> anyhow::Result<Self> {
        let mut directory = Self::new();
        for entry in entries {
            let key = key_from_hex(&entry.key)
                .map_err(|e| anyhow::anyhow!("server {}: {e}", entry.public_id))?;
            let layout = match &entry.nonce_offsets {
                Some(offsets) => NonceLayout::new(offsets)
                    .map_err(|e| anyhow::anyhow!("server {}: {e}", entry.public_id))?,
                None => NonceLayout::default(),
            };
            directory.insert(
                &entry.public_id,
                Credentials {
                    server_id: entry.server_id.clone(),
                    key,
                    layout,
                },
                entry.settings.clone(),
            );
        }
        Ok(directory)
    }

    pub fn insert(&mut self, public_id: &str, credentials: Credentials, settings: PostInitData) {
        self.settings
            .insert(credentials.server_id.clone(), settings);
        self.credentials.insert(public_id.to_string(), credentials);
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn credentials(&self, public_id: &str) -> Option<Credentials> {
        self.credentials.get(public_id).cloned()
    }

    async fn settings(&self, server_id: &str) -> Option<PostInitData> {
        self.settings.get(server_id).cloned()
    }
}
