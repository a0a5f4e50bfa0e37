//! High-level Tidewire client API.
//!
//! Provides [`Client`] for connecting to a Tidewire server and exchanging
//! namespaced events over a single session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::bootstrap::{Handshake, handshake};
use crate::core::{DEFAULT_CONNECT_TIMEOUT, HandlerError, ProtocolError, TransportError};
use crate::event::{
    AckReceiver, Arg, DirectOutbound, Dispatcher, Namespace, NamespaceSocket, Packet as EventPacket,
    Role, Socket,
};
use crate::transport::{Dialer, Headers, Heartbeat, Packet, PacketKind, Parameters, Session};

/// Errors that can occur in the Tidewire client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The target URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Failed to connect to server.
    #[error("connection failed: {0}")]
    ConnectionFailed(TransportError),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Transport failure on a live session.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL. Protocol query values are added when dialing.
    pub url: String,

    /// Extra headers handed to the dialer.
    pub headers: Headers,

    /// Time allowed for dial plus handshake.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/socket.io/".to_string(),
            headers: Headers::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Set the server URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Add a header sent when dialing.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects handlers before connecting, so that nothing the server sends
/// right after the handshake is missed.
pub struct ClientBuilder {
    config: ClientConfig,
    dispatcher: Dispatcher,
}

impl ClientBuilder {
    /// Create a builder for `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            dispatcher: Dispatcher::new(Role::Connecting),
        }
    }

    /// Register an event handler on `namespace`.
    pub fn on_event<F, Fut>(self, namespace: &str, event: &str, handler: F) -> Self
    where
        F: Fn(NamespaceSocket, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Arg>, HandlerError>> + Send + 'static,
    {
        self.dispatcher
            .namespaces()
            .get_or_create(namespace)
            .on(event, handler);
        self
    }

    /// Called when the server confirms a namespace.
    pub fn on_connect<F>(self, callback: F) -> Self
    where
        F: Fn(NamespaceSocket) + Send + Sync + 'static,
    {
        self.dispatcher.callbacks().set_connect(Arc::new(callback));
        self
    }

    /// Called when a namespace detaches or the session ends.
    pub fn on_disconnect<F>(self, callback: F) -> Self
    where
        F: Fn(NamespaceSocket) + Send + Sync + 'static,
    {
        self.dispatcher.callbacks().set_disconnect(Arc::new(callback));
        self
    }

    /// Called for every asynchronous failure.
    pub fn on_error<F>(self, callback: F) -> Self
    where
        F: Fn(ProtocolError) + Send + Sync + 'static,
    {
        self.dispatcher.callbacks().set_error(Arc::new(callback));
        self
    }

    /// Dial, complete the handshake and start the heartbeat and read loop.
    ///
    /// Handshake failures are returned here; everything after reaches the
    /// error callback.
    pub async fn connect(self, dialer: &dyn Dialer) -> Result<Client, ClientError> {
        let Handshake { conn, params } = handshake(dialer, &self.config).await?;
        let heartbeat = Heartbeat::from_parameters(&params);
        let session = Arc::new(Session::new(
            params.session_id.clone(),
            dialer.transport_name(),
            conn,
            heartbeat.deadlines(),
        ));
        let socket = Arc::new(Socket::new(Arc::clone(&session), Arc::new(DirectOutbound)));
        let shutdown = CancellationToken::new();

        let inner = Arc::new(ClientInner {
            params,
            session: Arc::clone(&session),
            socket,
            dispatcher: self.dispatcher,
            shutdown: shutdown.clone(),
        });
        info!(sid = %session.id(), transport = %session.transport(), "connected");

        let heartbeat_task = heartbeat.spawn(session, shutdown);
        let read_task = tokio::spawn(read_loop(Arc::clone(&inner)));
        Ok(Client {
            inner,
            tasks: Arc::new(Mutex::new(vec![heartbeat_task, read_task])),
        })
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

struct ClientInner {
    params: Parameters,
    session: Arc<Session>,
    socket: Arc<Socket>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
}

async fn read_loop(inner: Arc<ClientInner>) {
    let session = &inner.session;
    loop {
        let packet = match session.read().await {
            Ok(packet) => packet,
            Err(e) if !e.is_fatal() => {
                inner.dispatcher.callbacks().fire_error(e.into());
                continue;
            }
            Err(e) => {
                debug!(sid = %session.id(), error = %e, "read loop ended");
                break;
            }
        };
        match packet.kind {
            PacketKind::Message => {
                inner
                    .dispatcher
                    .on_message(&inner.socket, packet.payload)
                    .await;
            }
            PacketKind::Ping => {
                if let Err(e) = session.write(Packet::pong(packet.payload)).await {
                    debug!(sid = %session.id(), error = %e, "pong not sent");
                    break;
                }
            }
            PacketKind::Close => {
                debug!(sid = %session.id(), "server closed session");
                break;
            }
            PacketKind::Pong | PacketKind::Upgrade | PacketKind::Noop => {
                trace!(sid = %session.id(), kind = ?packet.kind, "ignored");
            }
            PacketKind::Open => {
                warn!(sid = %session.id(), "unexpected open packet");
            }
        }
    }

    inner.shutdown.cancel();
    if let Err(e) = session.close().await {
        debug!(sid = %session.id(), error = %e, "close failed");
    }
    inner.dispatcher.on_close(&inner.socket);
}

/// A Tidewire protocol client.
///
/// # Example
///
/// ```ignore
/// use tidewire_protocol::client::{ClientBuilder, ClientConfig};
///
/// let config = ClientConfig::builder()
///     .url("http://127.0.0.1:8080/socket.io/")
///     .build();
///
/// let client = ClientBuilder::new(config)
///     .on_event("/chat", "msg", |_socket, args| async move { Ok(args) })
///     .connect(&dialer)
///     .await?;
///
/// client.join("/chat").await?;
/// let reply = client.emit_with_ack("/chat", "msg", vec!["hi".into()]).await?.await?;
/// client.close().await?;
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Client {
    /// Start configuring a client.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Connect with no handlers registered up front.
    pub async fn connect(config: ClientConfig, dialer: &dyn Dialer) -> Result<Self, ClientError> {
        ClientBuilder::new(config).connect(dialer).await
    }

    /// Session id assigned by the server.
    pub fn session_id(&self) -> &str {
        self.inner.session.id()
    }

    /// Parameters negotiated in the handshake.
    pub fn parameters(&self) -> &Parameters {
        &self.inner.params
    }

    /// Check if the session is still open.
    pub fn is_connected(&self) -> bool {
        !self.inner.session.is_closed()
    }

    /// Check if the server has confirmed `namespace`.
    pub fn is_joined(&self, namespace: &str) -> bool {
        self.inner.socket.is_attached(namespace)
    }

    /// Wait until the session closes.
    pub async fn closed(&self) {
        self.inner.session.closed().await;
    }

    /// Emit an event.
    pub async fn emit(&self, namespace: &str, event: &str, args: Vec<Arg>) -> Result<(), ClientError> {
        Ok(self.inner.socket.emit(namespace, event, args).await?)
    }

    /// Emit an event and get a receiver for the server's acknowledgement.
    pub async fn emit_with_ack(
        &self,
        namespace: &str,
        event: &str,
        args: Vec<Arg>,
    ) -> Result<AckReceiver, ClientError> {
        Ok(self
            .inner
            .socket
            .emit_with_ack(namespace, event, args)
            .await?)
    }

    /// Ask the server to attach `namespace`. The connect callback fires once
    /// the server confirms.
    pub async fn join(&self, namespace: &str) -> Result<(), ClientError> {
        self.namespace(namespace);
        Ok(self.inner.socket.send(&EventPacket::connect(namespace)).await?)
    }

    /// Detach from `namespace`.
    pub async fn leave(&self, namespace: &str) -> Result<(), ClientError> {
        let scoped = NamespaceSocket::new(Arc::clone(&self.inner.socket), namespace);
        Ok(scoped.disconnect().await?)
    }

    /// Get a namespace, creating it if needed.
    pub fn namespace(&self, name: &str) -> Arc<Namespace> {
        self.inner.dispatcher.namespaces().get_or_create(name)
    }

    /// Register an event handler on `namespace`.
    pub fn on_event<F, Fut>(&self, namespace: &str, event: &str, handler: F)
    where
        F: Fn(NamespaceSocket, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Arg>, HandlerError>> + Send + 'static,
    {
        self.namespace(namespace).on(event, handler);
    }

    /// Called when the server confirms a namespace.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(NamespaceSocket) + Send + Sync + 'static,
    {
        self.inner.dispatcher.callbacks().set_connect(Arc::new(callback));
    }

    /// Called when a namespace detaches or the session ends.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(NamespaceSocket) + Send + Sync + 'static,
    {
        self.inner.dispatcher.callbacks().set_disconnect(Arc::new(callback));
    }

    /// Called for every asynchronous failure.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(ProtocolError) + Send + Sync + 'static,
    {
        self.inner.dispatcher.callbacks().set_error(Arc::new(callback));
    }

    /// Close the session and wait for background tasks to stop.
    ///
    /// Safe to call more than once, including concurrently.
    pub async fn close(&self) -> Result<(), ClientError> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if !self.inner.session.is_closed() {
            // Best effort: tell the server before the connection goes away.
            let _ = self.inner.session.write(Packet::close()).await;
        }
        self.inner.shutdown.cancel();
        self.inner.session.close().await?;
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "client task failed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.inner.session)
            .field("params", &self.inner.params)
            .finish()
    }
}
