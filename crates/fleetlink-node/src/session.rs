//! Session establishment: identification → handshake → initialize.
//!
//! 1. The peer's first frame is plaintext JSON `{"public_id", "session_id"}`.
//!    The public id selects the shared key; the session id becomes the AAD.
//! 2. We send a handshake carrying a fresh nonce layout `{"indices": [..]}`.
//!    The peer acknowledges under the old layout, then both sides switch.
//! 3. We send an `initialize` Message with the server's settings; the peer
//!    replies with its `init` snapshot and the connection becomes Ready.
//!
//! Any failure is reported and closes the connection.

use std::sync::Arc;

use fleetlink_crypto::{Cipher, NonceLayout};
use fleetlink_protocol::{Data, Message, ProtocolError, Request, RequestType};
use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionState, ServerInfo};
use crate::error::{ConnectionError, Result};
use crate::manager::ConnectionManager;

#[derive(Debug, Serialize, Deserialize)]
pub struct Identification {
    pub public_id: String,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeOffer {
    pub indices: NonceLayout,
}

pub async fn authenticate(manager: &ConnectionManager, conn: &Arc<Connection>, request: Request) {
    match establish(manager, conn, request).await {
        Ok(()) => {
            tracing::info!(
                public_id = conn.public_id().unwrap_or("-"),
                peer = %conn.peer_addr(),
                "session: ready"
            );
        }
        Err(ConnectionError::Closed) => {
            tracing::debug!(peer = %conn.peer_addr(), "session: peer left before promotion");
            conn.close().await;
        }
        Err(e) => {
            manager.observer().report("session", &e);
            conn.close().await;
        }
    }
}

async fn establish(manager: &ConnectionManager, conn: &Arc<Connection>, request: Request) -> Result<()> {
    let identity: Identification = serde_json::from_slice(&request.content)
        .map_err(|e| ConnectionError::Authentication(format!("malformed identification: {e}")))?;

    let Some(credentials) = manager.directory().credentials(&identity.public_id).await else {
        // Still plaintext: the peer has no key to read anything else
        let _ = conn
            .reply(&request.id, RequestType::Error, b"unknown public id".to_vec())
            .await;
        return Err(ConnectionError::Authentication(format!(
            "unknown public id {:?}",
            identity.public_id
        )));
    };

    let cipher = Cipher::new(&credentials.key, &identity.session_id, credentials.layout)
        .map_err(|e| ConnectionError::Authentication(e.to_string()))?;
    conn.identify(&identity.public_id, &credentials.server_id, cipher)?;
    tracing::debug!(public_id = %identity.public_id, "session: identified");

    handshake(conn).await?;
    initialize(manager, conn, &credentials.server_id).await?;
    manager.on_initialize(conn).await
}

async fn handshake(conn: &Connection) -> Result<()> {
    let layout = NonceLayout::random();
    let offer = serde_json::to_vec(&HandshakeOffer { indices: layout })?;
    let pending = conn.dispatch_request(RequestType::Handshake, offer).await?;
    pending
        .wait(conn.response_timeout())
        .await
        .into_result()
        .map_err(|rejection| {
            ConnectionError::from_rejection(rejection, pending.id().as_str(), conn.response_timeout())
        })?;
    conn.rotate_layout(layout);
    Ok(())
}

async fn initialize(manager: &ConnectionManager, conn: &Connection, server_id: &str) -> Result<()> {
    let settings = manager
        .directory()
        .settings(server_id)
        .await
        .unwrap_or_default();
    let message = Message::new("initialize")
        .with_server_id(server_id)
        .with_data(Data::PostInit(settings));

    let pending = conn
        .dispatch_request(RequestType::Initialize, message.to_json()?)
        .await?;
    let reply = pending.force().await?;
    let Data::Init(init) = reply.data else {
        return Err(ConnectionError::Protocol(ProtocolError::Schema(format!(
            "expected init data in initialize reply, got {}",
            reply.data.tag()
        ))));
    };

    conn.set_metadata(ServerInfo::from(init));
    conn.set_state(ConnectionState::Ready);
    Ok(())
}
