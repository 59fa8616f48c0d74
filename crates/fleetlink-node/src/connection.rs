//! Client connection -- one game server socket and everything it owns.
//!
//! Lifecycle: `Unauthenticated → Identified → Ready`, terminal `Closed`.
//!
//! The socket is split into a reader task and a writer task. The reader
//! decodes envelopes as data arrives; responses to our own requests are
//! matched against the Ledger on the spot, every other frame is handed to
//! the connection's worker pool, so inbound frames may complete out of
//! order. The writer drains a bounded queue of sealed envelopes.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use fleetlink_crypto::{Cipher, NonceLayout};
use fleetlink_protocol::schema::InitData;
use fleetlink_protocol::{
    frame, Callbacks, EnvelopeCodec, Message, Outcome, Promise, Rejection, Request, RequestId,
    RequestType,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{ConnectionError, Result};
use crate::ledger::{Ledger, Resolution};
use crate::manager::ConnectionManager;
use crate::observer::ErrorObserver;
use crate::worker_pool::WorkerPool;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Identified,
    Ready,
    Closed,
}

/// Snapshot of what the game server reported about itself at initialization.
/// Replaced as a whole, never mutated in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerInfo {
    pub server_name: String,
    pub price_per_object: i64,
    pub territory_lifetime: i64,
    pub territory_data: BTreeMap<String, Value>,
    pub server_start_time: Option<DateTime<Utc>>,
    pub extension_version: String,
    pub vg_enabled: bool,
}

impl From<InitData> for ServerInfo {
    fn from(init: InitData) -> Self {
        Self {
            server_name: init.server_name,
            price_per_object: init.price_per_object,
            territory_lifetime: init.territory_lifetime,
            territory_data: init.territory_data,
            server_start_time: Some(init.server_start_time),
            extension_version: init.extension_version,
            vg_enabled: init.vg_enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub workers: usize,
    pub write_queue: usize,
    pub response_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            workers: config.server.workers_per_connection,
            write_queue: config.server.write_queue,
            response_timeout: config.timeouts.response_timeout(),
        }
    }
}

/// A request on the wire whose response has not been awaited yet.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    promise: Promise<Vec<u8>>,
    ledger: Arc<Ledger>,
    server_id: Option<String>,
    timeout: Duration,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Raw response content, or the rejection. Never errors. An entry that
    /// did not complete is dropped from the Ledger.
    pub async fn wait(&self, timeout: Duration) -> Outcome<Vec<u8>> {
        let outcome = self.promise.wait(timeout).await;
        if !outcome.is_fulfilled() {
            self.ledger.remove(&self.id);
        }
        outcome
    }

    /// Wait for the response timeout and raise on failure. The response is
    /// parsed as a Message and tagged with the connection's server id.
    pub async fn force(self) -> Result<Message> {
        let content = self
            .wait(self.timeout)
            .await
            .into_result()
            .map_err(|rejection| {
                ConnectionError::from_rejection(rejection, self.id.as_str(), self.timeout)
            })?;
        let mut message = Message::from_json(&content)?;
        if let Some(server_id) = self.server_id {
            message.server_id = Some(server_id);
        }
        Ok(message.into_result()?)
    }
}

pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    public_id: OnceLock<String>,
    server_id: OnceLock<String>,
    cipher: RwLock<Option<Arc<Cipher>>>,
    metadata: RwLock<Arc<ServerInfo>>,
    ledger: Arc<Ledger>,
    pool: WorkerPool,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
    response_timeout: Duration,
    closed: AtomicBool,
    manager: Weak<ConnectionManager>,
    observer: Arc<dyn ErrorObserver>,
    on_close: Callbacks<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("public_id", &self.public_id())
            .field("pending", &self.ledger.len())
            .finish()
    }
}

impl Connection {
    /// Take ownership of an accepted socket and start its reader and writer.
    pub fn open(
        stream: TcpStream,
        settings: &ConnectionSettings,
        manager: Weak<ConnectionManager>,
        observer: Arc<dyn ErrorObserver>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::channel(settings.write_queue.max(1));
        let cancel = parent.child_token();
        let pool = WorkerPool::new(settings.workers, settings.write_queue, cancel.child_token());
        let now = Instant::now();

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            state: Mutex::new(ConnectionState::Unauthenticated),
            public_id: OnceLock::new(),
            server_id: OnceLock::new(),
            cipher: RwLock::new(None),
            metadata: RwLock::new(Arc::new(ServerInfo::default())),
            ledger: Arc::new(Ledger::new()),
            pool,
            outbound,
            cancel,
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            response_timeout: settings.response_timeout,
            closed: AtomicBool::new(false),
            manager,
            observer,
            on_close: Callbacks::default(),
        });

        tokio::spawn(write_loop(Arc::clone(&conn), writer, queue));
        tokio::spawn(read_loop(Arc::clone(&conn), reader));

        tracing::debug!(peer = %peer_addr, id = conn.id, "conn: opened");
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn public_id(&self) -> Option<&str> {
        self.public_id.get().map(String::as_str)
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.get().map(String::as_str)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.ledger.len()
    }

    pub fn metadata(&self) -> Arc<ServerInfo> {
        Arc::clone(&self.metadata.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn set_metadata(&self, info: ServerInfo) {
        *self.metadata.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(info);
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub fn on_close(&self, handler: impl Fn(&Connection) + Send + Sync + 'static) {
        self.on_close.register(handler);
    }

    fn cipher(&self) -> Option<Arc<Cipher>> {
        self.cipher.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Bind the peer's identity and session cipher. Only once per connection.
    pub fn identify(&self, public_id: &str, server_id: &str, cipher: Cipher) -> Result<()> {
        if self.state() != ConnectionState::Unauthenticated {
            return Err(ConnectionError::Authentication(
                "connection already identified".into(),
            ));
        }
        self.public_id
            .set(public_id.to_string())
            .map_err(|_| ConnectionError::Authentication("connection already identified".into()))?;
        let _ = self.server_id.set(server_id.to_string());
        *self.cipher.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(cipher));
        self.set_state(ConnectionState::Identified);
        Ok(())
    }

    /// Switch the session cipher to a new nonce layout.
    pub fn rotate_layout(&self, layout: NonceLayout) {
        let mut cipher = self.cipher.write().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = cipher.as_ref() {
            *cipher = Some(Arc::new(current.with_layout(layout)));
        }
    }

    /// Decode one envelope. Unreadable input is reported and yields `None`.
    pub fn read_frame(&self, envelope: &[u8]) -> Option<Request> {
        if envelope.is_empty() {
            return None;
        }
        let cipher = self.cipher();
        match frame::open(envelope, cipher.as_deref()) {
            Ok(request) => Some(request),
            Err(e) => {
                // Sealed bytes while we still expect plaintext: a key problem, not bad JSON
                let error = if cipher.is_none() && frame::looks_sealed(envelope) {
                    ConnectionError::Decryption
                } else {
                    ConnectionError::from(e)
                };
                tracing::warn!(
                    peer = %self.peer_addr,
                    public_id = self.public_id().unwrap_or("-"),
                    "conn: dropped unreadable frame"
                );
                self.observer.report("read", &error);
                None
            }
        }
    }

    /// Match a frame against our outstanding requests.
    pub(crate) fn complete(&self, request: &Request) -> Resolution {
        let outcome = match request.kind {
            RequestType::Error => Outcome::Rejected(Rejection::Peer(request.content_lossy())),
            _ => Outcome::Fulfilled(request.content.clone()),
        };
        let resolution = self.ledger.resolve(&request.id, outcome);
        if resolution == Resolution::Duplicate {
            tracing::debug!(
                public_id = self.public_id().unwrap_or("-"),
                request_id = %request.id,
                "conn: duplicate response dropped"
            );
        }
        resolution
    }

    async fn receive(self: &Arc<Self>, envelope: Bytes) {
        let Some(request) = self.read_frame(&envelope) else {
            return;
        };
        if self.complete(&request) != Resolution::Unknown {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            tracing::debug!(request_id = %request.id, "conn: no manager, frame dropped");
            return;
        };
        let conn = Arc::clone(self);
        let job = async move { manager.handle_frame(conn, request).await };
        if self.pool.execute(job).await.is_err() {
            tracing::debug!(peer = %self.peer_addr, "conn: pool closed, frame dropped");
        }
    }

    async fn transmit(&self, request: &Request) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let envelope = frame::seal(request, self.cipher().as_deref())?;
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Send a request and return without waiting for the response.
    pub async fn dispatch_request(
        &self,
        kind: RequestType,
        content: impl Into<Vec<u8>>,
    ) -> Result<PendingRequest> {
        let request = Request::new(kind, content);
        let promise = self.ledger.add(&request);
        if let Err(e) = self.transmit(&request).await {
            self.ledger.remove(&request.id);
            return Err(e);
        }
        tracing::trace!(
            public_id = self.public_id().unwrap_or("-"),
            request_id = %request.id,
            kind = %kind,
            "conn: request sent"
        );
        Ok(PendingRequest {
            id: request.id,
            promise,
            ledger: Arc::clone(&self.ledger),
            server_id: self.server_id().map(str::to_string),
            timeout: self.response_timeout,
        })
    }

    /// Send a request and wait up to the response timeout for its Message.
    pub async fn send_request(
        &self,
        kind: RequestType,
        content: impl Into<Vec<u8>>,
    ) -> Result<Message> {
        self.dispatch_request(kind, content).await?.force().await
    }

    pub async fn send_message(&self, message: &Message) -> Result<Message> {
        let content = message.to_json()?;
        self.send_request(RequestType::Message, content).await
    }

    /// Fire-and-forget error frame.
    pub async fn send_error(&self, text: &str) -> Result<()> {
        self.transmit(&Request::new(RequestType::Error, text.as_bytes().to_vec()))
            .await
    }

    /// Answer an inbound request. Replies are not tracked in the Ledger.
    pub async fn reply(
        &self,
        id: &RequestId,
        kind: RequestType,
        content: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let request = Request {
            id: id.clone(),
            kind,
            content: content.into(),
        };
        self.transmit(&request).await
    }

    /// Tear down: stop the tasks, reject every pending request, fire
    /// `on_close` and deregister from the manager. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.cancel.cancel();
        let rejected = self.ledger.reject_all(Rejection::Closed);
        tracing::info!(
            peer = %self.peer_addr,
            public_id = self.public_id().unwrap_or("-"),
            rejected,
            "conn: closed"
        );
        self.on_close.fire(self);
        if let Some(manager) = self.manager.upgrade() {
            manager.on_disconnect(self).await;
        }
    }
}

async fn write_envelope(
    writer: &mut OwnedWriteHalf,
    codec: &mut EnvelopeCodec,
    buf: &mut BytesMut,
    envelope: Bytes,
) -> Result<()> {
    buf.clear();
    codec.encode(envelope, buf)?;
    writer.write_all(buf).await?;
    Ok(())
}

async fn write_loop(conn: Arc<Connection>, mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    let mut codec = EnvelopeCodec;
    let mut buf = BytesMut::new();

    loop {
        let envelope = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            envelope = queue.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        if let Err(e) = write_envelope(&mut writer, &mut codec, &mut buf, envelope).await {
            conn.observer.report("write", &e);
            conn.close().await;
            return;
        }
    }

    // Frames queued before the close still go out
    while let Ok(envelope) = queue.try_recv() {
        if write_envelope(&mut writer, &mut codec, &mut buf, envelope)
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    let mut codec = EnvelopeCodec;
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let read = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                tracing::debug!(peer = %conn.peer_addr, "conn: peer hung up");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                conn.observer.report("read", &ConnectionError::Io(e));
                break;
            }
        }

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(envelope)) => conn.receive(envelope).await,
                Ok(None) => break,
                Err(e) => {
                    // Framing is lost; nothing after this can be trusted
                    conn.observer.report("read", &ConnectionError::from(e));
                    conn.close().await;
                    return;
                }
            }
        }
    }
    conn.close().await;
}
