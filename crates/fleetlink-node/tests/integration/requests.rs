//! Outbound requests over an established session: timeouts, concurrency,
//! duplicates and peer errors.

use std::time::Duration;

use fleetlink_node::ConnectionError;
use fleetlink_protocol::{Data, Message, RequestType};

use crate::harness::{test_config, TestServer};

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let started = tokio::time::Instant::now();
    let message = Message::new("query");
    let result = conn.send_message(&message).await;
    assert!(matches!(result, Err(ConnectionError::RequestTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(conn.pending_requests(), 0);

    // The peer saw the request even though it never answered
    let seen = peer.recv().await;
    assert_eq!(seen.kind, RequestType::Message);
    assert!(!conn.is_closed());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_returns_before_response() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let pending = conn
        .dispatch_request(RequestType::Message, Message::new("query").to_json().unwrap())
        .await
        .unwrap();
    assert_eq!(conn.pending_requests(), 1);

    let request = peer.recv().await;
    assert_eq!(&request.id, pending.id());
    peer.answer_message(&request, Data::Empty).await;

    let reply = pending.force().await.unwrap();
    assert_eq!(reply.kind, "query");
    assert_eq!(reply.server_id.as_deref(), Some("srv-alpha"));
    assert_eq!(conn.pending_requests(), 0);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_resolve_out_of_order() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let first = conn
        .dispatch_request(RequestType::Message, Message::new("first").to_json().unwrap())
        .await
        .unwrap();
    let second = conn
        .dispatch_request(RequestType::Message, Message::new("second").to_json().unwrap())
        .await
        .unwrap();

    let a = peer.recv().await;
    let b = peer.recv().await;
    peer.answer_message(&b, Data::Empty).await;
    peer.answer_message(&a, Data::Empty).await;

    assert_eq!(second.force().await.unwrap().kind, "second");
    assert_eq!(first.force().await.unwrap().kind, "first");
    ts.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_response_is_ignored() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let pending = conn
        .dispatch_request(RequestType::Message, Message::new("query").to_json().unwrap())
        .await
        .unwrap();
    let request = peer.recv().await;
    peer.answer_message(&request, Data::Empty).await;
    peer.answer_message(&request, Data::Empty).await;

    assert_eq!(pending.force().await.unwrap().kind, "query");
    // Neither echoed nor routed as a fresh inbound Message
    assert!(peer.try_recv(Duration::from_millis(300)).await.is_none());
    assert!(!conn.is_closed());
    assert!(ts.observer.kinds().is_empty());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_peer_error_rejects_request() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let pending = conn
        .dispatch_request(RequestType::Message, Message::new("query").to_json().unwrap())
        .await
        .unwrap();
    let request = peer.recv().await;
    peer.send(&request.reply(RequestType::Error, b"territory not found".to_vec()))
        .await;

    match pending.force().await {
        Err(ConnectionError::RejectedRequest(reason)) => assert_eq!(reason, "territory not found"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(!conn.is_closed());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_close_rejects_outstanding_requests() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let pending = conn
        .dispatch_request(RequestType::Message, Message::new("query").to_json().unwrap())
        .await
        .unwrap();
    peer.recv().await;
    conn.close().await;

    assert!(matches!(pending.force().await, Err(ConnectionError::Closed)));
    assert!(matches!(
        conn.send_error("late").await,
        Err(ConnectionError::Closed)
    ));
    ts.wait_gone("alpha", Duration::from_secs(1)).await.unwrap();
    ts.shutdown().await;
}
