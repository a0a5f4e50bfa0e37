//! Echo server: answers `msg` on `/chat` and announces joins.

use std::sync::Arc;
use std::time::Duration;

use tidewire_protocol::core::{HandlerError, TRANSPORT_POLLING, TRANSPORT_WEBSOCKET};
use tidewire_protocol::server::{Server, ServerConfig};
use tidewire_protocol::transport::memory::MemoryAcceptor;
use tidewire_protocol::Arg;
use tracing::{info, warn};

/// Build the echo server with both in-memory transports registered.
pub fn build() -> Server {
    let config = ServerConfig::builder()
        .ping_interval(Duration::from_secs(5))
        .ping_timeout(Duration::from_secs(2))
        .build();
    let server = Server::new(config);
    server.register_transport(Arc::new(MemoryAcceptor::new(TRANSPORT_POLLING)));
    server.register_transport(Arc::new(MemoryAcceptor::new(TRANSPORT_WEBSOCKET)));

    server.on_connect(|socket| {
        info!(sid = %socket.session_id(), namespace = %socket.namespace(), "joined");
    });
    server.on_disconnect(|socket| {
        info!(sid = %socket.session_id(), namespace = %socket.namespace(), "left");
    });
    server.on_error(|error| warn!(%error, "server error"));

    server.on_event("/chat", "msg", |socket, args| async move {
        info!(sid = %socket.session_id(), ?args, "msg");
        socket.emit("echo", args.clone()).await?;
        Ok::<_, HandlerError>(vec![Arg::from("ok")])
    });
    server.on_event("/chat", "upload", |_socket, args| async move {
        let size: usize = args.iter().filter_map(Arg::as_bytes).map(|b| b.len()).sum();
        Ok::<_, HandlerError>(vec![Arg::from(serde_json::json!({ "received": size }))])
    });
    server
}
