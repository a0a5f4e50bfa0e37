//! Session upgrades, request rejection and heartbeat expiry, driven at the
//! control-packet level against a real server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tidewire_protocol::core::{
    HandlerError, PROTOCOL_VERSION, QUERY_SESSION, QUERY_TRANSPORT, QUERY_VERSION,
    TRANSPORT_POLLING, TRANSPORT_WEBSOCKET,
};
use tidewire_protocol::event::Packet as EventPacket;
use tidewire_protocol::server::{RequestError, ServerConfig};
use tidewire_protocol::transport::memory::MemoryConnection;
use tidewire_protocol::transport::{Connection, Packet, PacketKind, Payload, Request};
use tidewire_protocol::Arg;

use common::{eventually, fixture, next_text, raw_open, raw_request};

/// Collect every event number buffered on `conn` until it closes.
async fn drain_numbers(conn: &MemoryConnection, into: &mut Vec<i64>) {
    while let Ok(packet) = conn.read_packet().await {
        if packet.kind != PacketKind::Message {
            continue;
        }
        let Payload::Text(text) = packet.payload else {
            continue;
        };
        let (event, args) = EventPacket::decode_text(&text)
            .unwrap()
            .event_args()
            .unwrap();
        assert_eq!(event, "n");
        into.push(args[0].as_json().and_then(|v| v.as_i64()).unwrap());
    }
}

#[tokio::test]
async fn test_upgrade_preserves_order_across_connections() {
    let fx = fixture(ServerConfig::default());
    let (polling, params) = raw_open(&fx.server).await;
    assert_eq!(next_text(&polling).await, "0");

    let sid = params.session_id.clone();
    eventually(|| fx.server.socket(&sid).is_some()).await;
    let socket = fx.server.socket(&sid).unwrap();

    for i in 0..20 {
        socket.emit("/", "n", vec![Arg::from(json!(i))]).await.unwrap();
    }
    let (request, websocket) = raw_request(TRANSPORT_WEBSOCKET, Some(&sid));
    fx.server.handle(request).await.unwrap();
    for i in 20..40 {
        socket.emit("/", "n", vec![Arg::from(json!(i))]).await.unwrap();
    }
    assert_eq!(socket.session().transport(), TRANSPORT_WEBSOCKET);

    // The old pipe is retired: it yields what it buffered, then ends.
    let mut seen = Vec::new();
    drain_numbers(&polling, &mut seen).await;
    let before_swap = seen.len();

    let reader = tokio::spawn(async move {
        let mut rest = Vec::new();
        drain_numbers(&websocket, &mut rest).await;
        rest
    });
    fx.server.close().await.unwrap();
    seen.extend(reader.await.unwrap());

    assert!(before_swap <= 40);
    assert_eq!(seen, (0..40).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_reads_follow_upgraded_connection() {
    let fx = fixture(ServerConfig::default());
    let received = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&received);
    fx.server.on_event("/", "note", move |_socket, args| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(args[0].as_str().unwrap_or_default().to_string());
            Ok::<_, HandlerError>(Vec::new())
        }
    });

    let (polling, params) = raw_open(&fx.server).await;
    polling
        .write_packet(Packet::message(r#"2["note","before"]"#))
        .await
        .unwrap();
    eventually(|| received.lock().len() == 1).await;

    let (request, websocket) = raw_request(TRANSPORT_WEBSOCKET, Some(&params.session_id));
    fx.server.handle(request).await.unwrap();
    websocket
        .write_packet(Packet::message(r#"2["note","after"]"#))
        .await
        .unwrap();
    eventually(|| received.lock().len() == 2).await;
    assert_eq!(*received.lock(), vec!["before", "after"]);

    fx.server.close().await.unwrap();
}

#[tokio::test]
async fn test_server_answers_ping_after_upgrade() {
    let fx = fixture(ServerConfig::default());
    let (_polling, params) = raw_open(&fx.server).await;

    let (request, websocket) = raw_request(TRANSPORT_WEBSOCKET, Some(&params.session_id));
    fx.server.handle(request).await.unwrap();
    websocket
        .write_packet(Packet::ping(Payload::Text("beat".into())))
        .await
        .unwrap();

    loop {
        let packet = websocket.read_packet().await.unwrap();
        if packet.kind == PacketKind::Pong {
            assert_eq!(packet.payload, Payload::Text("beat".into()));
            break;
        }
    }
    fx.server.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_requests_leave_sessions_alone() {
    let fx = fixture(ServerConfig::default());
    let (_polling, params) = raw_open(&fx.server).await;

    let (request, _conn) = raw_request(TRANSPORT_POLLING, Some("nope"));
    let err = fx.server.handle(request).await.unwrap_err();
    assert!(matches!(err, RequestError::InvalidSession(_)));
    assert_eq!(err.status_code(), 400);

    let (request, _conn) = raw_request("carrier-pigeon", None);
    let err = fx.server.handle(request).await.unwrap_err();
    assert!(matches!(err, RequestError::InvalidTransport(_)));

    let mut query = std::collections::HashMap::new();
    query.insert(QUERY_VERSION.to_string(), "2".to_string());
    query.insert(QUERY_TRANSPORT.to_string(), TRANSPORT_POLLING.to_string());
    let err = fx.server.handle(Request::new(query)).await.unwrap_err();
    assert!(matches!(err, RequestError::UnsupportedVersion(v) if v == "2"));

    // An upgrade request with nothing to accept fails before pausing.
    let mut query = std::collections::HashMap::new();
    query.insert(QUERY_VERSION.to_string(), PROTOCOL_VERSION.to_string());
    query.insert(QUERY_TRANSPORT.to_string(), TRANSPORT_WEBSOCKET.to_string());
    query.insert(QUERY_SESSION.to_string(), params.session_id.clone());
    let err = fx.server.handle(Request::new(query)).await.unwrap_err();
    assert!(matches!(err, RequestError::AcceptFailed(_)));

    assert_eq!(fx.server.session_count(), 1);
    eventually(|| fx.server.socket(&params.session_id).is_some()).await;
    let socket = fx.server.socket(&params.session_id).unwrap();
    assert_eq!(socket.session().transport(), TRANSPORT_POLLING);
    assert!(!socket.session().is_closed());
    fx.server.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_dropped_after_deadline() {
    let config = ServerConfig::builder()
        .ping_interval(Duration::from_millis(50))
        .ping_timeout(Duration::from_millis(50))
        .build();
    let fx = fixture(config);
    let left = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&left);
    fx.server
        .on_disconnect(move |socket| seen.lock().push(socket.namespace().to_string()));

    let (polling, _params) = raw_open(&fx.server).await;
    assert_eq!(fx.server.session_count(), 1);

    // Never ping; the server's read deadline is interval plus timeout.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fx.server.session_count(), 0);
    assert_eq!(*left.lock(), vec!["/".to_string()]);
    assert!(polling.is_closed());

    fx.server.close().await.unwrap();
}
