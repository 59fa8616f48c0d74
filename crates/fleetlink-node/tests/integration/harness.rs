//! Test harness for in-process fleetlink-node integration tests.
//!
//! Provides TestServer (a started ConnectionServer on an ephemeral port) and
//! TestPeer (a scripted game server speaking the wire protocol over TCP).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{TimeZone, Utc};
use fleetlink_crypto::{Cipher, NonceLayout};
use fleetlink_node::config::{NodeConfig, ServerEntry};
use fleetlink_node::{Connection, ConnectionError, ConnectionServer, ErrorObserver, StaticDirectory};
use fleetlink_protocol::frame;
use fleetlink_protocol::schema::{InitData, PostInitData};
use fleetlink_protocol::{Data, EnvelopeCodec, Message, Request, RequestType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

pub const KEY: [u8; 32] = [7u8; 32];

pub fn server_entry(public_id: &str) -> ServerEntry {
    ServerEntry {
        public_id: public_id.to_string(),
        server_id: format!("srv-{public_id}"),
        key: hex::encode(KEY),
        nonce_offsets: None,
        settings: PostInitData {
            community_id: "esm".into(),
            territory_admin_uids: vec!["76561198000000000".into()],
            ..Default::default()
        },
    }
}

/// Small timeouts so the sweeps act within a test's lifetime.
pub fn test_config(public_ids: &[&str]) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.server.listen_addr = "127.0.0.1:0".into();
    cfg.server.workers_per_connection = 4;
    cfg.timeouts.lobby_timeout_ms = 5_000;
    cfg.timeouts.lobby_sweep_ms = 50;
    cfg.timeouts.heartbeat_interval_ms = 60_000;
    cfg.timeouts.heartbeat_timeout_ms = 500;
    cfg.timeouts.heartbeat_sweep_ms = 50;
    cfg.timeouts.response_timeout_ms = 1_000;
    cfg.overseer.sweep_ms = 50;
    cfg.overseer.message_expiry_ms = 5_000;
    cfg.servers = public_ids.iter().map(|id| server_entry(id)).collect();
    cfg
}

/// Observer that keeps every report for later assertions.
#[derive(Default)]
pub struct CollectingObserver {
    reports: Mutex<Vec<(String, &'static str)>>,
}

#[allow(dead_code)]
impl CollectingObserver {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.reports.lock().unwrap().iter().map(|(_, kind)| *kind).collect()
    }

    pub fn origins(&self) -> Vec<String> {
        self.reports.lock().unwrap().iter().map(|(origin, _)| origin.clone()).collect()
    }
}

impl ErrorObserver for CollectingObserver {
    fn report(&self, origin: &str, error: &ConnectionError) {
        self.reports
            .lock()
            .unwrap()
            .push((origin.to_string(), error.kind()));
    }
}

pub struct TestServer {
    pub server: Arc<ConnectionServer>,
    pub observer: Arc<CollectingObserver>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start(cfg: NodeConfig) -> Self {
        let directory = StaticDirectory::from_entries(&cfg.servers).unwrap();
        let observer = Arc::new(CollectingObserver::default());
        let server = ConnectionServer::bind(cfg, Arc::new(directory), observer.clone())
            .await
            .unwrap();
        server.start().await.unwrap();
        Self { server, observer }
    }

    pub async fn connect(&self) -> TestPeer {
        TestPeer::connect(&self.server.local_addr().to_string()).await
    }

    /// Connect and run the whole identification, handshake and initialize exchange.
    pub async fn connect_ready(&self, public_id: &str) -> (TestPeer, Arc<Connection>) {
        let mut peer = self.connect().await;
        peer.identify_full(public_id).await;
        let conn = self.wait_client(public_id, Duration::from_secs(2)).await.unwrap();
        (peer, conn)
    }

    /// Poll the registry until `public_id` is authenticated, or timeout.
    pub async fn wait_client(&self, public_id: &str, timeout: Duration) -> anyhow::Result<Arc<Connection>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(conn) = self.server.client(public_id).await {
                return Ok(conn);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {} to authenticate", public_id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the lobby holds exactly `n` connections, or timeout.
    pub async fn wait_lobby_len(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let have = self.server.manager().lobby_len().await;
            if have == n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for lobby of {} (have {})", n, have);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `public_id` is no longer authenticated, or timeout.
    pub async fn wait_gone(&self, public_id: &str, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.server.client(public_id).await.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {} to disconnect", public_id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.server.stop().await;
    }
}

pub fn init_data(server_name: &str) -> InitData {
    InitData {
        server_name: server_name.to_string(),
        price_per_object: 150,
        territory_lifetime: 7,
        territory_data: BTreeMap::new(),
        server_start_time: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap(),
        extension_version: "2.0.0".into(),
        vg_enabled: false,
    }
}

/// A scripted game server on the far side of the socket.
pub struct TestPeer {
    stream: TcpStream,
    buf: BytesMut,
    pub cipher: Option<Cipher>,
}

#[allow(dead_code)]
impl TestPeer {
    pub async fn connect(addr: &str) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
            cipher: None,
        }
    }

    /// Seal with the current cipher (plaintext before identification).
    pub async fn send(&mut self, request: &Request) {
        let envelope = frame::seal(request, self.cipher.as_ref()).unwrap();
        self.send_raw(envelope).await;
    }

    pub async fn send_raw(&mut self, envelope: Bytes) {
        let mut out = BytesMut::new();
        EnvelopeCodec.encode(envelope, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    /// Next frame from the server, or `None` once the socket is closed.
    pub async fn try_recv(&mut self, timeout: Duration) -> Option<Request> {
        let read = async {
            loop {
                if let Some(envelope) = EnvelopeCodec.decode(&mut self.buf).unwrap() {
                    return Some(frame::open(&envelope, self.cipher.as_ref()).unwrap());
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        };
        tokio::time::timeout(timeout, read).await.ok().flatten()
    }

    pub async fn recv(&mut self) -> Request {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("no frame from server")
    }

    /// True once the server has closed the socket.
    pub async fn hung_up(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Plaintext identification frame.
    pub async fn identify(&mut self, public_id: &str, session_id: &str) {
        let content = serde_json::to_vec(&serde_json::json!({
            "public_id": public_id,
            "session_id": session_id,
        }))
        .unwrap();
        self.send(&Request::new(RequestType::Identification, content)).await;
    }

    /// Identification, handshake and initialize, as a well-behaved server does them.
    pub async fn identify_full(&mut self, public_id: &str) -> PostInitData {
        let session_id = format!("session-{public_id}");
        self.identify(public_id, &session_id).await;
        self.cipher = Some(Cipher::new(&KEY, &session_id, NonceLayout::default()).unwrap());

        let handshake = self.recv().await;
        assert_eq!(handshake.kind, RequestType::Handshake);
        let offer: serde_json::Value = serde_json::from_slice(&handshake.content).unwrap();
        let indices: Vec<u8> = serde_json::from_value(offer["indices"].clone()).unwrap();
        // Acknowledge under the old layout, then switch
        self.send(&handshake.reply(RequestType::Handshake, Vec::new())).await;
        let layout = NonceLayout::new(&indices).unwrap();
        self.cipher = self.cipher.as_ref().map(|c| c.with_layout(layout));

        let initialize = self.recv().await;
        assert_eq!(initialize.kind, RequestType::Initialize);
        let message = Message::from_json(&initialize.content).unwrap();
        assert_eq!(message.kind, "initialize");
        let Data::PostInit(settings) = message.data.clone() else {
            panic!("initialize without post_init data: {:?}", message.data);
        };

        let reply = message.reply().with_data(Data::Init(init_data(public_id)));
        self.send(&initialize.reply(RequestType::Initialize, reply.to_json().unwrap()))
            .await;
        settings
    }

    /// Answer a server-sent Message request with `data`.
    pub async fn answer_message(&mut self, request: &Request, data: Data) {
        let message = Message::from_json(&request.content).unwrap();
        let reply = message.reply().with_data(data);
        self.send(&request.reply(RequestType::Message, reply.to_json().unwrap()))
            .await;
    }
}
