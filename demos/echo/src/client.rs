//! Echo client: joins `/chat`, sends text and binary, prints the replies.

use tidewire_protocol::client::{Client, ClientConfig, ClientError};
use tidewire_protocol::core::HandlerError;
use tidewire_protocol::transport::Dialer;
use tidewire_protocol::Arg;
use tracing::{info, warn};

/// Connect through `dialer` with handlers for the server's echoes.
pub async fn connect(dialer: &dyn Dialer) -> Result<Client, ClientError> {
    let config = ClientConfig::builder().url("memory://echo/socket.io/").build();
    Client::builder(config)
        .on_connect(|socket| info!(namespace = %socket.namespace(), "server confirmed namespace"))
        .on_error(|error| warn!(%error, "client error"))
        .on_event("/chat", "echo", |_socket, args| async move {
            info!(?args, "echo");
            Ok::<_, HandlerError>(Vec::new())
        })
        .connect(dialer)
        .await
}

/// Run one exchange on `/chat`.
pub async fn exchange(client: &Client) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    client.join("/chat").await?;

    let reply = client
        .emit_with_ack("/chat", "msg", vec![Arg::from("hello")])
        .await?
        .await?;
    info!(?reply, "msg acknowledged");

    let reply = client
        .emit_with_ack("/chat", "upload", vec![Arg::from(vec![0u8; 1024])])
        .await?
        .await?;
    info!(?reply, "upload acknowledged");
    Ok(())
}
