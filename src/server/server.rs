//! High-level Tidewire server API.
//!
//! Provides [`Server`] for accepting sessions over any registered transport
//! and exchanging namespaced events with them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::EngineServer;
use crate::core::{
    DEFAULT_EMITTER_CAPACITY, DEFAULT_MAX_SESSIONS, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT,
    HandlerError, ProtocolError, TRANSPORT_WEBSOCKET, TransportError,
};
use crate::event::{Arg, Dispatcher, Namespace, NamespaceSocket, Outbound, Role, Socket};
use crate::transport::{Acceptor, Request, Session};

/// Reasons a transport request is refused.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The `EIO` query value does not match the protocol version.
    #[error("protocol version incompatible: {0:?}")]
    UnsupportedVersion(String),

    /// The transport is unknown, or not an allowed upgrade target.
    #[error("invalid transport: {0:?}")]
    InvalidTransport(String),

    /// No live session has this id.
    #[error("invalid session: {0:?}")]
    InvalidSession(String),

    /// The session cap has been reached.
    #[error("too many sessions (limit {0})")]
    TooManySessions(usize),

    /// The server is shutting down.
    #[error("server shut down")]
    Shutdown,

    /// The transport could not accept the request.
    #[error("accept failed: {0}")]
    AcceptFailed(TransportError),

    /// The session failed while serving the request.
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl RequestError {
    /// HTTP-equivalent status code for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::UnsupportedVersion(_)
            | RequestError::InvalidTransport(_)
            | RequestError::InvalidSession(_) => 400,
            RequestError::TooManySessions(_) | RequestError::Shutdown => 503,
            RequestError::AcceptFailed(_) | RequestError::Transport(_) => 500,
        }
    }
}

/// Errors that can occur in the Tidewire server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Request negotiation failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Transport failure while sending.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Server is shut down.
    #[error("server shut down")]
    Shutdown,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval at which clients are told to ping.
    pub ping_interval: Duration,

    /// Time allowed for a ping round trip.
    pub ping_timeout: Duration,

    /// Transports sessions may upgrade to.
    pub upgrades: Vec<String>,

    /// Capacity of the outbound queue.
    pub emitter_capacity: usize,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
}

impl ServerConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            upgrades: vec![TRANSPORT_WEBSOCKET.to_string()],
            emitter_capacity: DEFAULT_EMITTER_CAPACITY,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Set the ping interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Set the ping timeout.
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Set the transports sessions may upgrade to.
    pub fn upgrades<I, T>(mut self, upgrades: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.config.upgrades = upgrades.into_iter().map(Into::into).collect();
        self
    }

    /// Set the outbound queue capacity.
    pub fn emitter_capacity(mut self, capacity: usize) -> Self {
        self.config.emitter_capacity = capacity;
        self
    }

    /// Set the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    engine: EngineServer,
    dispatcher: Dispatcher,
    sockets: Mutex<HashMap<String, Arc<Socket>>>,
}

impl ServerInner {
    async fn serve(&self, session: Arc<Session>, socket: Arc<Socket>) {
        self.dispatcher.on_open(&socket).await;

        let dispatcher = &self.dispatcher;
        let scoped = &socket;
        self.engine
            .run_session(
                &session,
                move |payload| dispatcher.on_message(scoped, payload),
                move |error| dispatcher.callbacks().fire_error(error),
            )
            .await;

        self.sockets.lock().remove(session.id());
        dispatcher.on_close(&socket);
        debug!(sid = %session.id(), "session finished");
    }
}

/// A Tidewire protocol server.
///
/// Transports hand their requests to [`handle`](Self::handle); each new
/// session gets its own read loop and shares one outbound emitter.
///
/// # Example
///
/// ```ignore
/// use tidewire_protocol::server::{Server, ServerConfig};
///
/// let server = Server::new(ServerConfig::default());
/// server.register_transport(Arc::new(MyPollingAcceptor::new()));
///
/// server.on_event("/chat", "msg", |socket, args| async move {
///     socket.emit("echo", args).await?;
///     Ok(vec![Arg::from("ok")])
/// });
///
/// // From the HTTP layer:
/// server.handle(request).await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
    accept_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Server {
    /// Create a server and start its accept loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let (engine, accepted) = EngineServer::new(config);
        let inner = Arc::new(ServerInner {
            engine,
            dispatcher: Dispatcher::new(Role::Accepting),
            sockets: Mutex::new(HashMap::new()),
        });
        let task = tokio::spawn(accept_loop(Arc::clone(&inner), accepted));
        Self {
            inner,
            accept_task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        self.inner.engine.config()
    }

    /// Register a transport acceptor.
    pub fn register_transport(&self, acceptor: Arc<dyn Acceptor>) {
        self.inner.engine.register(acceptor);
    }

    /// Handle one transport request.
    pub async fn handle(&self, request: Request) -> Result<(), RequestError> {
        self.inner.engine.handle(request).await
    }

    /// Handle every request arriving on `requests` until the channel closes
    /// or the server shuts down.
    ///
    /// Pairs with [`MemoryDialer`](crate::transport::memory::MemoryDialer).
    pub fn serve_requests(&self, mut requests: mpsc::Receiver<Request>) -> JoinHandle<()> {
        let server = self.clone();
        let shutdown = self.inner.engine.shutdown_token();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    () = shutdown.cancelled() => break,
                    next = requests.recv() => match next {
                        Some(request) => request,
                        None => break,
                    },
                };
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.handle(request).await {
                        warn!(error = %e, status = e.status_code(), "request rejected");
                    }
                });
            }
        })
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

    /// Called when a session attaches to a namespace.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(NamespaceSocket) + Send + Sync + 'static,
    {
        self.inner.dispatcher.callbacks().set_connect(Arc::new(callback));
    }

    /// Called when a session detaches from a namespace or ends.
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

    /// Emit an event to every session attached to `namespace`.
    ///
    /// Returns the number of sessions the event was queued for.
    pub async fn broadcast(
        &self,
        namespace: &str,
        event: &str,
        args: Vec<Arg>,
    ) -> Result<usize, ServerError> {
        if self.inner.engine.is_closed() {
            return Err(ServerError::Shutdown);
        }
        let targets: Vec<Arc<Socket>> = self
            .inner
            .sockets
            .lock()
            .values()
            .filter(|socket| socket.is_attached(namespace))
            .cloned()
            .collect();

        let mut sent = 0;
        for socket in targets {
            match socket.emit(namespace, event, args.clone()).await {
                Ok(()) => sent += 1,
                Err(TransportError::SessionClosed) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sent)
    }

    /// Socket for a live session.
    pub fn socket(&self, session_id: &str) -> Option<Arc<Socket>> {
        self.inner.sockets.lock().get(session_id).cloned()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.engine.sessions().len()
    }

    /// Shut down: drain queued writes, close every session and stop the
    /// accept loop. Safe to call more than once.
    pub async fn close(&self) -> Result<(), ServerError> {
        self.inner.engine.close().await;
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "accept loop failed");
            }
            info!("server closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("engine", &self.inner.engine)
            .field("namespaces", &self.inner.dispatcher.namespaces().names())
            .finish()
    }
}

async fn accept_loop(inner: Arc<ServerInner>, mut accepted: mpsc::Receiver<Arc<Session>>) {
    let shutdown = inner.engine.shutdown_token();
    loop {
        let session = tokio::select! {
            () = shutdown.cancelled() => break,
            next = accepted.recv() => match next {
                Some(session) => session,
                None => break,
            },
        };
        let outbound: Arc<dyn Outbound> = inner.engine.emitter().clone();
        let socket = Arc::new(Socket::new(Arc::clone(&session), outbound));
        inner
            .sockets
            .lock()
            .insert(session.id().to_string(), Arc::clone(&socket));

        let inner = Arc::clone(&inner);
        tokio::spawn(async move { inner.serve(session, socket).await });
    }
    debug!("accept loop stopped");
}
