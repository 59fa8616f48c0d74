//! Lobby eviction and heartbeat supervision.

use std::time::Duration;

use fleetlink_protocol::{Request, RequestType};

use crate::harness::{test_config, TestServer};

#[tokio::test]
async fn test_silent_socket_is_evicted_from_lobby() {
    let mut cfg = test_config(&["alpha"]);
    cfg.timeouts.lobby_timeout_ms = 200;
    let ts = TestServer::start(cfg).await;

    let mut peer = ts.connect().await;
    ts.wait_lobby_len(1, Duration::from_secs(1)).await.unwrap();

    assert!(peer.hung_up(Duration::from_secs(2)).await);
    ts.wait_lobby_len(0, Duration::from_secs(1)).await.unwrap();
    ts.shutdown().await;
}

#[tokio::test]
async fn test_authenticated_session_leaves_lobby_before_timeout() {
    let mut cfg = test_config(&["alpha"]);
    cfg.timeouts.lobby_timeout_ms = 400;
    let ts = TestServer::start(cfg).await;

    let (mut peer, conn) = ts.connect_ready("alpha").await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!conn.is_closed());
    assert!(!peer.hung_up(Duration::from_millis(100)).await);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_frame_before_identification_closes() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let mut peer = ts.connect().await;
    peer.send(&Request::new(RequestType::Noop, Vec::new())).await;

    assert!(peer.hung_up(Duration::from_secs(2)).await);
    assert_eq!(ts.observer.kinds(), vec!["authentication"]);
    ts.wait_lobby_len(0, Duration::from_secs(1)).await.unwrap();
    ts.shutdown().await;
}

#[tokio::test]
async fn test_responsive_peer_survives_heartbeats() {
    let mut cfg = test_config(&["alpha"]);
    cfg.timeouts.heartbeat_interval_ms = 100;
    cfg.timeouts.heartbeat_timeout_ms = 300;
    let ts = TestServer::start(cfg).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let mut echoed = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
    while tokio::time::Instant::now() < deadline {
        if let Some(probe) = peer.try_recv(Duration::from_millis(200)).await {
            assert_eq!(probe.kind, RequestType::Noop);
            peer.send(&probe.reply(RequestType::Noop, Vec::new())).await;
            echoed += 1;
        }
    }

    assert!(echoed >= 2, "expected repeated probes, got {echoed}");
    assert!(!conn.is_closed());
    assert!(ts.server.client("alpha").await.is_some());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_fails_heartbeat() {
    let mut cfg = test_config(&["alpha"]);
    cfg.timeouts.heartbeat_interval_ms = 100;
    cfg.timeouts.heartbeat_timeout_ms = 200;
    let ts = TestServer::start(cfg).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let probe = peer.recv().await;
    assert_eq!(probe.kind, RequestType::Noop);
    let probed_at = tokio::time::Instant::now();

    ts.wait_gone("alpha", Duration::from_secs(2)).await.unwrap();
    // heartbeat_timeout plus one sweep, with scheduling slack
    assert!(probed_at.elapsed() < Duration::from_millis(200 + 50 + 250));
    assert!(conn.is_closed());
    assert!(peer.hung_up(Duration::from_secs(2)).await);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_peer_noop_is_echoed() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, _conn) = ts.connect_ready("alpha").await;

    let ping = Request::new(RequestType::Noop, Vec::new());
    peer.send(&ping).await;
    let pong = peer.recv().await;
    assert_eq!(pong.id, ping.id);
    assert_eq!(pong.kind, RequestType::Noop);
    ts.shutdown().await;
}
