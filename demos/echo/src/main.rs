//! Tidewire Echo Demo
//!
//! Runs an echo server and a client in one process over the in-memory
//! transport.
//!
//! Environment variables:
//! - RUST_LOG: log filter, e.g. `info` or `tidewire_protocol=debug`
//! - TIDEWIRE_CLIENTS: number of concurrent clients (default 2)

mod client;
mod server;

use tidewire_protocol::core::TRANSPORT_POLLING;
use tidewire_protocol::transport::memory::MemoryDialer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let clients: usize = std::env::var("TIDEWIRE_CLIENTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);

    let server = server::build();
    let (requests, incoming) = tokio::sync::mpsc::channel(16);
    server.serve_requests(incoming);
    let dialer = MemoryDialer::new(TRANSPORT_POLLING, requests);

    let mut connected = Vec::with_capacity(clients);
    for _ in 0..clients {
        let client = client::connect(&dialer).await?;
        info!(sid = %client.session_id(), "client connected");
        connected.push(client);
    }

    for client in &connected {
        if let Err(e) = client::exchange(client).await {
            error!(sid = %client.session_id(), error = %e, "exchange failed");
        }
    }

    let reached = server
        .broadcast("/chat", "echo", vec!["goodbye".into()])
        .await?;
    info!(reached, sessions = server.session_count(), "broadcast sent");

    for client in &connected {
        client.close().await?;
    }
    server.close().await?;
    Ok(())
}
