//! Messages in both directions: inbound routing and outbound delivery with
//! overseer supervision.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetlink_node::{Connection, ConnectionError, FnHandler};
use fleetlink_protocol::schema::{EventData, QueryResultData};
use fleetlink_protocol::{Data, Message, MessageError, Request, RequestType};

use crate::harness::{test_config, TestServer};

fn event(name: &str) -> Message {
    Message::new("event").with_data(Data::Event(EventData {
        name: name.to_string(),
        attributes: BTreeMap::new(),
    }))
}

async fn wait_count(counter: &AtomicUsize, n: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    counter.load(Ordering::SeqCst) >= n
}

#[tokio::test]
async fn test_inbound_message_is_routed_and_answered() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    ts.server
        .on_message(
            "event",
            FnHandler(move |conn: &Connection, message: &Message| -> Result<Data, MessageError> {
                assert_eq!(conn.public_id(), Some("alpha"));
                assert_eq!(message.server_id.as_deref(), Some("srv-alpha"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Data::QueryResult(QueryResultData {
                    results: vec![serde_json::json!(1)],
                }))
            }),
        )
        .await;
    let (mut peer, _conn) = ts.connect_ready("alpha").await;

    let inbound = event("flag_stolen");
    let request = Request::new(RequestType::Message, inbound.to_json().unwrap());
    peer.send(&request).await;

    let answer = peer.recv().await;
    assert_eq!(answer.id, request.id);
    assert_eq!(answer.kind, RequestType::Message);
    let reply = Message::from_json(&answer.content).unwrap();
    assert_eq!(reply.id, inbound.id);
    assert!(reply.errors.is_empty());
    assert_eq!(
        reply.data,
        Data::QueryResult(QueryResultData {
            results: vec![serde_json::json!(1)]
        })
    );
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_travels_in_reply() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    ts.server
        .on_message(
            "event",
            FnHandler(|_: &Connection, _: &Message| -> Result<Data, MessageError> {
                Err(MessageError::code("territory_missing"))
            }),
        )
        .await;
    let (mut peer, _conn) = ts.connect_ready("alpha").await;

    peer.send(&Request::new(RequestType::Message, event("upgrade").to_json().unwrap()))
        .await;
    let reply = Message::from_json(&peer.recv().await.content).unwrap();
    assert_eq!(reply.errors, vec![MessageError::code("territory_missing")]);
    ts.shutdown().await;
}

#[tokio::test]
async fn test_unknown_message_type_is_answered_with_error() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    peer.send(&Request::new(RequestType::Message, Message::new("mystery").to_json().unwrap()))
        .await;
    let reply = Message::from_json(&peer.recv().await.content).unwrap();
    assert_eq!(reply.kind, "mystery");
    assert_eq!(reply.errors, vec![MessageError::code("unknown_message_type")]);
    assert!(!conn.is_closed());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_gets_error_frame() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, conn) = ts.connect_ready("alpha").await;

    let request = Request::new(RequestType::Message, b"{\"id\":".to_vec());
    peer.send(&request).await;
    let answer = peer.recv().await;
    assert_eq!(answer.id, request.id);
    assert_eq!(answer.kind, RequestType::Error);
    assert_eq!(ts.observer.kinds(), vec!["protocol"]);
    assert_eq!(ts.observer.origins(), vec!["message".to_string()]);
    assert!(!conn.is_closed());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_send_message_to_unknown_client() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let message = Message::new("query");
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    message.on_error(move |failed| {
        assert_eq!(failed.errors, vec![MessageError::undeliverable()]);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let result = ts.server.send_message("ghost", message.clone(), false).await;
    assert!(matches!(
        result,
        Err(ConnectionError::Undeliverable { ref public_id, message_id })
            if public_id == "ghost" && message_id == message.id
    ));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(ts.server.overseer().is_empty());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_blocking_send_returns_reply() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, _conn) = ts.connect_ready("alpha").await;

    let message = Message::new("query");
    let (result, _) = tokio::join!(
        ts.server.send_message("alpha", message.clone(), true),
        async {
            let request = peer.recv().await;
            let outbound = Message::from_json(&request.content).unwrap();
            assert_eq!(outbound.server_id.as_deref(), Some("srv-alpha"));
            peer.answer_message(&request, Data::Empty).await;
        }
    );

    let reply = result.unwrap().unwrap();
    assert_eq!(reply.id, message.id);
    assert!(message.is_delivered());
    assert!(ts.server.overseer().is_empty());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_non_blocking_send_fires_on_response_once() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, _conn) = ts.connect_ready("alpha").await;

    let message = Message::new("query");
    let responses = Arc::new(AtomicUsize::new(0));
    let counter = responses.clone();
    message.on_response(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let result = ts.server.send_message("alpha", message.clone(), false).await;
    assert!(matches!(result, Ok(None)));
    assert_eq!(responses.load(Ordering::SeqCst), 0);

    let request = peer.recv().await;
    peer.answer_message(&request, Data::Empty).await;
    assert!(wait_count(&responses, 1, Duration::from_secs(2)).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(responses.load(Ordering::SeqCst), 1);
    assert!(ts.server.overseer().is_empty());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_send_fires_on_error_once() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, _conn) = ts.connect_ready("alpha").await;

    let message = Message::new("query");
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    message.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    ts.server.send_message("alpha", message.clone(), false).await.unwrap();
    peer.recv().await;
    assert!(wait_count(&errors, 1, Duration::from_secs(3)).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(message.is_delivered());
    assert!(ts.server.overseer().is_empty());
    ts.shutdown().await;
}

#[tokio::test]
async fn test_blocking_send_surfaces_reply_errors() {
    let ts = TestServer::start(test_config(&["alpha"])).await;
    let (mut peer, _conn) = ts.connect_ready("alpha").await;

    let message = Message::new("query");
    let (result, _) = tokio::join!(
        ts.server.send_message("alpha", message.clone(), true),
        async {
            let request = peer.recv().await;
            let mut reply = Message::from_json(&request.content).unwrap().reply();
            reply.add_error(MessageError::message("no such player"));
            peer.send(&request.reply(RequestType::Message, reply.to_json().unwrap()))
                .await;
        }
    );

    match result {
        Err(ConnectionError::Protocol(e)) => assert!(e.to_string().contains("no such player")),
        other => panic!("expected message errors, got {other:?}"),
    }
    ts.shutdown().await;
}
