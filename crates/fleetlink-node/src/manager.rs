//! Connection manager -- lobby, authenticated registry and heartbeats.
//!
//! New sockets wait in the lobby (in connect order) until they finish
//! identification, handshake and initialization, then move into the
//! authenticated map keyed by public id and join the heartbeat queue.
//!
//! The lobby is ordered by connect time, so each sweep evicts from the head
//! until it meets a connection that is still within `lobby_timeout`. An
//! unauthenticated socket is therefore closed no later than `lobby_timeout`
//! plus one sweep interval.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fleetlink_protocol::{Message, Outcome, Request, RequestType};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionSettings, ConnectionState};
use crate::directory::ServerDirectory;
use crate::error::{ConnectionError, Result};
use crate::observer::ErrorObserver;
use crate::router::EventRouter;
use crate::session;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub connection: ConnectionSettings,
    pub lobby_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            connection: ConnectionSettings::from_config(config),
            lobby_timeout: config.timeouts.lobby_timeout(),
            heartbeat_interval: config.timeouts.heartbeat_interval(),
            heartbeat_timeout: config.timeouts.heartbeat_timeout(),
        }
    }
}

pub struct ConnectionManager {
    lobby: Mutex<VecDeque<Arc<Connection>>>,
    authenticated: RwLock<HashMap<String, Arc<Connection>>>,
    heartbeat_queue: Mutex<VecDeque<String>>,
    directory: Arc<dyn ServerDirectory>,
    observer: Arc<dyn ErrorObserver>,
    router: Arc<EventRouter>,
    settings: ManagerSettings,
    cancel: CancellationToken,
    me: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        settings: ManagerSettings,
        directory: Arc<dyn ServerDirectory>,
        observer: Arc<dyn ErrorObserver>,
        router: Arc<EventRouter>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            lobby: Mutex::new(VecDeque::new()),
            authenticated: RwLock::new(HashMap::new()),
            heartbeat_queue: Mutex::new(VecDeque::new()),
            directory,
            observer,
            router,
            settings,
            cancel,
            me: me.clone(),
        })
    }

    pub fn directory(&self) -> &Arc<dyn ServerDirectory> {
        &self.directory
    }

    pub fn observer(&self) -> &Arc<dyn ErrorObserver> {
        &self.observer
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Wrap a freshly accepted socket and park it in the lobby.
    pub async fn on_connect(&self, stream: TcpStream) -> Result<Arc<Connection>> {
        if self.cancel.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        let conn = Connection::open(
            stream,
            &self.settings.connection,
            self.me.clone(),
            Arc::clone(&self.observer),
            &self.cancel,
        )?;
        let lobby_size = {
            let mut lobby = self.lobby.lock().await;
            lobby.push_back(Arc::clone(&conn));
            lobby.len()
        };
        tracing::info!(peer = %conn.peer_addr(), lobby_size, "lobby: connection accepted");
        Ok(conn)
    }

    /// Promote an initialized connection out of the lobby. An older session
    /// for the same public id is closed. A connection that closed meanwhile
    /// is refused with `Closed`.
    pub async fn on_initialize(&self, conn: &Arc<Connection>) -> Result<()> {
        let Some(public_id) = conn.public_id().map(str::to_string) else {
            return Err(ConnectionError::Authentication(
                "initialized without a public id".into(),
            ));
        };

        self.lobby.lock().await.retain(|c| c.id() != conn.id());
        let (previous, authenticated) = {
            let mut map = self.authenticated.write().await;
            // Checked under the lock: `close` flags before on_disconnect runs
            if conn.is_closed() {
                return Err(ConnectionError::Closed);
            }
            let previous = map.insert(public_id.clone(), Arc::clone(conn));
            (previous, map.len())
        };
        {
            let mut queue = self.heartbeat_queue.lock().await;
            if !queue.contains(&public_id) {
                queue.push_back(public_id.clone());
            }
        }
        conn.record_heartbeat();

        tracing::info!(
            %public_id,
            server_id = conn.server_id().unwrap_or("-"),
            authenticated,
            "pool: server authenticated"
        );

        if let Some(previous) = previous.filter(|p| p.id() != conn.id()) {
            tracing::warn!(%public_id, "pool: replacing older session");
            previous.close().await;
        }
        Ok(())
    }

    /// Forget a connection wherever it is registered.
    pub async fn on_disconnect(&self, conn: &Connection) {
        self.lobby.lock().await.retain(|c| c.id() != conn.id());

        let Some(public_id) = conn.public_id() else {
            return;
        };
        let removed = {
            let mut map = self.authenticated.write().await;
            if map.get(public_id).is_some_and(|c| c.id() == conn.id()) {
                map.remove(public_id);
                true
            } else {
                false
            }
        };
        if removed {
            self.heartbeat_queue
                .lock()
                .await
                .retain(|id| id.as_str() != public_id);
            tracing::info!(%public_id, "pool: server disconnected");
        }
    }

    pub async fn find(&self, public_id: &str) -> Option<Arc<Connection>> {
        self.authenticated.read().await.get(public_id).cloned()
    }

    pub async fn lobby_len(&self) -> usize {
        self.lobby.lock().await.len()
    }

    pub async fn authenticated_len(&self) -> usize {
        self.authenticated.read().await.len()
    }

    /// Close every lobby connection older than `lobby_timeout`.
    pub async fn lobby_sweep(&self) -> usize {
        let expired: Vec<Arc<Connection>> = {
            let mut lobby = self.lobby.lock().await;
            let mut expired = Vec::new();
            while let Some(head) = lobby.front() {
                if head.connected_at().elapsed() < self.settings.lobby_timeout {
                    break;
                }
                if let Some(conn) = lobby.pop_front() {
                    expired.push(conn);
                }
            }
            expired
        };

        for conn in &expired {
            tracing::info!(
                peer = %conn.peer_addr(),
                age_ms = conn.connected_at().elapsed().as_millis() as u64,
                "lobby: evicting unauthenticated connection"
            );
            conn.close().await;
        }
        expired.len()
    }

    /// One pass over the heartbeat queue. Stale connections get a `noop`
    /// probe on their worker pool; they rejoin the queue on success and are
    /// closed on failure.
    pub async fn heartbeat_sweep(&self) {
        let due: Vec<String> = {
            let mut queue = self.heartbeat_queue.lock().await;
            queue.drain(..).collect()
        };

        let mut requeue = Vec::new();
        for public_id in due {
            let Some(conn) = self.find(&public_id).await else {
                continue;
            };
            if conn.last_heartbeat().elapsed() < self.settings.heartbeat_interval {
                requeue.push(public_id);
                continue;
            }

            let Some(manager) = self.me.upgrade() else {
                return;
            };
            let probe_conn = Arc::clone(&conn);
            let timeout = self.settings.heartbeat_timeout;
            let probe = async move { manager.probe(probe_conn, timeout).await };
            match conn.pool().try_execute(probe) {
                Ok(()) => {}
                Err(ConnectionError::Closed) => {
                    tracing::debug!(%public_id, "hb: pool closed, probe dropped");
                }
                Err(e) => {
                    // Busy pool: try again next sweep rather than wait on it
                    self.observer.report("heartbeat", &e);
                    requeue.push(public_id);
                }
            }
        }

        if !requeue.is_empty() {
            let mut queue = self.heartbeat_queue.lock().await;
            for public_id in requeue {
                if !queue.contains(&public_id) {
                    queue.push_back(public_id);
                }
            }
        }
    }

    async fn probe(&self, conn: Arc<Connection>, timeout: Duration) {
        let public_id = conn.public_id().unwrap_or("-").to_string();
        let outcome = match conn.dispatch_request(RequestType::Noop, Vec::new()).await {
            Ok(pending) => pending.wait(timeout).await,
            Err(e) => {
                tracing::debug!(%public_id, "hb: probe send failed: {e}");
                conn.close().await;
                return;
            }
        };

        match outcome {
            Outcome::Fulfilled(_) => {
                conn.record_heartbeat();
                tracing::trace!(%public_id, "hb: ok");
                if self.find(&public_id).await.is_some_and(|c| c.id() == conn.id()) {
                    let mut queue = self.heartbeat_queue.lock().await;
                    if !queue.contains(&public_id) {
                        queue.push_back(public_id);
                    }
                }
            }
            Outcome::Rejected(reason) => {
                tracing::warn!(%public_id, %reason, "hb: heartbeat failed, closing");
                conn.close().await;
            }
        }
    }

    /// Route an inbound frame that did not answer one of our requests.
    pub async fn handle_frame(&self, conn: Arc<Connection>, request: Request) {
        if conn.state() == ConnectionState::Unauthenticated {
            if request.kind == RequestType::Identification {
                session::authenticate(self, &conn, request).await;
            } else {
                self.observer.report(
                    "frame",
                    &ConnectionError::Authentication(format!(
                        "{} frame before identification",
                        request.kind
                    )),
                );
                conn.close().await;
            }
            return;
        }

        match request.kind {
            RequestType::Noop => {
                if let Err(e) = conn.reply(&request.id, RequestType::Noop, Vec::new()).await {
                    tracing::debug!(request_id = %request.id, "hb: echo failed: {e}");
                }
            }
            RequestType::Message => self.route_message(&conn, request).await,
            RequestType::Error => {
                tracing::warn!(
                    public_id = conn.public_id().unwrap_or("-"),
                    request_id = %request.id,
                    content = %request.content_lossy(),
                    "conn: unsolicited error from peer"
                );
            }
            RequestType::Identification | RequestType::Handshake | RequestType::Initialize => {
                self.observer.report(
                    "frame",
                    &ConnectionError::Protocol(fleetlink_protocol::ProtocolError::Schema(
                        format!("unexpected {} frame on an established session", request.kind),
                    )),
                );
            }
        }
    }

    async fn route_message(&self, conn: &Connection, request: Request) {
        let mut message = match Message::from_json(&request.content) {
            Ok(message) => message,
            Err(e) => {
                let error = ConnectionError::from(e);
                let _ = conn
                    .reply(&request.id, RequestType::Error, error.to_string().into_bytes())
                    .await;
                self.observer.report("message", &error);
                return;
            }
        };
        if let Some(server_id) = conn.server_id() {
            message.server_id = Some(server_id.to_string());
        }

        let reply = self.router.dispatch(conn, &message).await;
        let sent = match reply.to_json() {
            Ok(content) => conn.reply(&request.id, RequestType::Message, content).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.observer.report("message", &e);
        }
    }

    /// Run `lobby_sweep` every `interval` until stopped.
    pub async fn run_lobby_sweep(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.lobby_sweep().await;
                }
            }
        }
    }

    /// Run `heartbeat_sweep` every `interval` until stopped.
    pub async fn run_heartbeat_sweep(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat_sweep().await;
                }
            }
        }
    }

    /// Stop the sweeps and close every connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut all: Vec<Arc<Connection>> = self.lobby.lock().await.drain(..).collect();
        all.extend(self.authenticated.write().await.drain().map(|(_, conn)| conn));
        self.heartbeat_queue.lock().await.clear();

        let closing = all.len();
        for conn in all {
            conn.close().await;
        }
        tracing::info!(closed = closing, "pool: manager stopped");
    }
}
