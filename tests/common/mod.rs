#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tidewire_protocol::client::{Client, ClientBuilder, ClientConfig};
use tidewire_protocol::core::{
    PROTOCOL_VERSION, QUERY_SESSION, QUERY_TRANSPORT, QUERY_VERSION, TRANSPORT_POLLING,
    TRANSPORT_WEBSOCKET,
};
use tidewire_protocol::server::{Server, ServerConfig};
use tidewire_protocol::transport::memory::{MemoryAcceptor, MemoryConnection, MemoryDialer, pair};
use tidewire_protocol::transport::{Connection, Parameters, Payload, Request};
use tokio::sync::mpsc;

pub struct Fixture {
    pub server: Server,
    pub dialer: MemoryDialer,
}

pub fn fixture(config: ServerConfig) -> Fixture {
    let server = Server::new(config);
    server.register_transport(Arc::new(MemoryAcceptor::new(TRANSPORT_POLLING)));
    server.register_transport(Arc::new(MemoryAcceptor::new(TRANSPORT_WEBSOCKET)));
    let (requests, incoming) = mpsc::channel(16);
    server.serve_requests(incoming);
    Fixture {
        server,
        dialer: MemoryDialer::new(TRANSPORT_POLLING, requests),
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig::builder()
        .url("memory://test/socket.io/")
        .connect_timeout(Duration::from_secs(5))
        .build()
}

impl Fixture {
    pub async fn client(&self) -> Client {
        Client::connect(client_config(), &self.dialer).await.unwrap()
    }

    pub async fn client_with(&self, builder: ClientBuilder) -> Client {
        builder.connect(&self.dialer).await.unwrap()
    }
}

/// A transport request carrying the far end of a fresh pipe.
pub fn raw_request(transport: &str, sid: Option<&str>) -> (Request, MemoryConnection) {
    let mut query = HashMap::new();
    query.insert(QUERY_VERSION.to_string(), PROTOCOL_VERSION.to_string());
    query.insert(QUERY_TRANSPORT.to_string(), transport.to_string());
    if let Some(sid) = sid {
        query.insert(QUERY_SESSION.to_string(), sid.to_string());
    }
    let (local, remote) = pair(256);
    (Request::new(query).with_upgrade(remote), local)
}

/// Open a session by hand and return the client end with its parameters.
pub async fn raw_open(server: &Server) -> (MemoryConnection, Parameters) {
    let (request, conn) = raw_request(TRANSPORT_POLLING, None);
    server.handle(request).await.unwrap();
    let params = Parameters::from_packet(&conn.read_packet().await.unwrap()).unwrap();
    (conn, params)
}

pub async fn next_text(conn: &MemoryConnection) -> String {
    match conn.read_packet().await.unwrap().payload {
        Payload::Text(text) => text,
        Payload::Binary(bytes) => panic!("expected text, got {} bytes", bytes.len()),
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
