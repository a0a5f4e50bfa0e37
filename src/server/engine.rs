//! Accepting-role transport engine.
//!
//! Negotiates incoming requests into sessions, orchestrates transport
//! upgrades, answers pings and owns the outbound emitter. It knows nothing
//! about namespaces or events; the application [`Server`](super::Server)
//! layers those on top.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::emitter::Emitter;
use super::server::{RequestError, ServerConfig};
use super::session::SessionRegistry;
use crate::core::{ACCEPT_BACKLOG, PROTOCOL_VERSION, ProtocolError};
use crate::transport::{
    Acceptor, Heartbeat, Packet, PacketKind, Parameters, Payload, Request, Session,
};

/// Transport engine for the accepting role.
pub struct EngineServer {
    config: ServerConfig,
    acceptors: RwLock<HashMap<String, Arc<dyn Acceptor>>>,
    sessions: SessionRegistry,
    emitter: Arc<Emitter>,
    opened: mpsc::Sender<Arc<Session>>,
    shutdown: CancellationToken,
    close_once: AtomicBool,
}

impl EngineServer {
    /// Create an engine and start its emitter.
    ///
    /// Newly opened sessions are delivered on the returned channel, which
    /// the caller drains in its accept loop.
    pub fn new(config: ServerConfig) -> (Self, mpsc::Receiver<Arc<Session>>) {
        let shutdown = CancellationToken::new();
        let emitter = Arc::new(Emitter::spawn(config.emitter_capacity, shutdown.clone()));
        let (opened, accepted) = mpsc::channel(ACCEPT_BACKLOG);
        let engine = Self {
            config,
            acceptors: RwLock::new(HashMap::new()),
            sessions: SessionRegistry::new(),
            emitter,
            opened,
            shutdown,
            close_once: AtomicBool::new(false),
        };
        (engine, accepted)
    }

    /// Register the acceptor for its transport name.
    pub fn register(&self, acceptor: Arc<dyn Acceptor>) {
        let name = acceptor.transport_name().to_string();
        debug!(transport = %name, "transport registered");
        self.acceptors.write().insert(name, acceptor);
    }

    /// Engine configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Outbound emitter shared by all sessions.
    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    /// Token cancelled when the engine closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check if the engine has been closed.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat::new(self.config.ping_interval, self.config.ping_timeout)
    }

    /// Handle one transport request.
    ///
    /// Without a session id a new session is opened. With one, the request
    /// either upgrades that session to a new transport or is forwarded to
    /// its current connection.
    pub async fn handle(&self, mut request: Request) -> Result<(), RequestError> {
        if request.protocol_version() != Some(PROTOCOL_VERSION) {
            return Err(RequestError::UnsupportedVersion(
                request.protocol_version().unwrap_or_default().to_string(),
            ));
        }
        let transport = request.transport().unwrap_or_default().to_string();
        let acceptor = self
            .acceptors
            .read()
            .get(&transport)
            .cloned()
            .ok_or_else(|| RequestError::InvalidTransport(transport.clone()))?;

        match request.session_id().map(str::to_string) {
            None => self.open(acceptor, transport, request).await,
            Some(sid) => {
                let session = self
                    .sessions
                    .get(&sid)
                    .ok_or(RequestError::InvalidSession(sid))?;
                if session.transport() != transport {
                    self.upgrade(&session, acceptor, transport, &mut request)
                        .await?;
                }
                session.serve(request).await.map_err(RequestError::Transport)
            }
        }
    }

    async fn open(
        &self,
        acceptor: Arc<dyn Acceptor>,
        transport: String,
        mut request: Request,
    ) -> Result<(), RequestError> {
        if self.is_closed() {
            return Err(RequestError::Shutdown);
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(RequestError::TooManySessions(self.config.max_sessions));
        }

        let conn = acceptor
            .accept(&mut request)
            .await
            .map_err(RequestError::AcceptFailed)?;
        let heartbeat = self.heartbeat();
        let limit = self.config.max_sessions;
        let built = self.sessions.insert_new(limit, |id| {
            Arc::new(Session::new(
                id,
                transport.clone(),
                Arc::clone(&conn),
                heartbeat.deadlines(),
            ))
        });
        let Some(session) = built else {
            // Lost a race for the last slot after accepting.
            let _ = conn.close().await;
            return Err(RequestError::TooManySessions(limit));
        };

        let params = Parameters {
            session_id: session.id().to_string(),
            upgrades: self.config.upgrades.clone(),
            ping_interval_ms: millis(self.config.ping_interval),
            ping_timeout_ms: millis(self.config.ping_timeout),
        };
        let announced = match self.emitter.enqueue(&session, vec![Packet::open(&params)]).await {
            Ok(()) => self.opened.send(Arc::clone(&session)).await.is_ok(),
            Err(_) => false,
        };
        if !announced {
            self.sessions.remove(session.id());
            let _ = session.close().await;
            return Err(RequestError::Shutdown);
        }
        info!(sid = %session.id(), %transport, "session opened");

        session.serve(request).await.map_err(RequestError::Transport)
    }

    async fn upgrade(
        &self,
        session: &Arc<Session>,
        acceptor: Arc<dyn Acceptor>,
        transport: String,
        request: &mut Request,
    ) -> Result<(), RequestError> {
        if !self.config.upgrades.iter().any(|t| *t == transport) {
            return Err(RequestError::InvalidTransport(transport));
        }
        // Accept before pausing so a failed accept leaves the session untouched.
        let conn = acceptor
            .accept(request)
            .await
            .map_err(RequestError::AcceptFailed)?;
        session
            .upgrade(transport, conn)
            .await
            .map_err(RequestError::Transport)
    }

    /// Drive the read loop of `session` until it ends, then remove and
    /// close it.
    ///
    /// Pings are answered here. `message` payloads go to `on_message`;
    /// malformed packets go to `on_error` and do not end the loop.
    pub async fn run_session<F, Fut, E>(&self, session: &Arc<Session>, mut on_message: F, on_error: E)
    where
        F: FnMut(Payload) -> Fut,
        Fut: Future<Output = ()>,
        E: Fn(ProtocolError),
    {
        loop {
            let packet = match session.read().await {
                Ok(packet) => packet,
                Err(e) if !e.is_fatal() => {
                    on_error(e.into());
                    continue;
                }
                Err(e) => {
                    debug!(sid = %session.id(), error = %e, "read loop ended");
                    break;
                }
            };
            match packet.kind {
                PacketKind::Ping => {
                    let pong = vec![Packet::pong(packet.payload)];
                    if let Err(e) = self.emitter.enqueue(session, pong).await {
                        debug!(sid = %session.id(), error = %e, "pong not sent");
                        break;
                    }
                }
                PacketKind::Message => on_message(packet.payload).await,
                PacketKind::Close => {
                    debug!(sid = %session.id(), "peer closed session");
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

        self.sessions.remove(session.id());
        if let Err(e) = session.close().await {
            debug!(sid = %session.id(), error = %e, "close failed");
        }
    }

    /// Stop accepting, drain the emitter and close every session.
    ///
    /// Only the first call does any work.
    pub async fn close(&self) {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.emitter.join().await;
        for session in self.sessions.drain() {
            if let Err(e) = session.close().await {
                debug!(sid = %session.id(), error = %e, "close failed");
            }
        }
        info!("engine closed");
    }
}

impl std::fmt::Debug for EngineServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut transports: Vec<String> = self.acceptors.read().keys().cloned().collect();
        transports.sort();
        f.debug_struct("EngineServer")
            .field("config", &self.config)
            .field("transports", &transports)
            .field("sessions", &self.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::core::{QUERY_SESSION, QUERY_TRANSPORT, QUERY_VERSION};
    use crate::transport::memory::{MemoryAcceptor, MemoryConnection, pair};
    use crate::transport::{Connection, SessionState};

    fn engine() -> (EngineServer, mpsc::Receiver<Arc<Session>>) {
        let config = ServerConfig::builder()
            .ping_interval(Duration::from_millis(25_000))
            .ping_timeout(Duration::from_millis(5_000))
            .max_sessions(2)
            .build();
        let (engine, accepted) = EngineServer::new(config);
        engine.register(Arc::new(MemoryAcceptor::new("polling")));
        engine.register(Arc::new(MemoryAcceptor::new("websocket")));
        (engine, accepted)
    }

    fn request(transport: &str, sid: Option<&str>) -> (Request, MemoryConnection) {
        let mut query = HashMap::new();
        query.insert(QUERY_VERSION.to_string(), PROTOCOL_VERSION.to_string());
        query.insert(QUERY_TRANSPORT.to_string(), transport.to_string());
        if let Some(sid) = sid {
            query.insert(QUERY_SESSION.to_string(), sid.to_string());
        }
        let (local, remote) = pair(16);
        (Request::new(query).with_upgrade(remote), local)
    }

    #[tokio::test]
    async fn test_open_sends_parameters() {
        let (engine, mut accepted) = engine();
        let (req, client) = request("polling", None);
        engine.handle(req).await.unwrap();

        let session = accepted.recv().await.unwrap();
        let params = Parameters::from_packet(&client.read_packet().await.unwrap()).unwrap();
        assert_eq!(params.session_id, session.id());
        assert_eq!(params.ping_interval_ms, 25_000);
        assert_eq!(params.ping_timeout_ms, 5_000);
        assert_eq!(params.upgrades, vec!["websocket".to_string()]);
        assert_eq!(engine.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_version() {
        let (engine, _accepted) = engine();
        let mut query = HashMap::new();
        query.insert(QUERY_VERSION.to_string(), "4".to_string());
        query.insert(QUERY_TRANSPORT.to_string(), "polling".to_string());
        let err = engine.handle(Request::new(query)).await.unwrap_err();
        assert!(matches!(err, RequestError::UnsupportedVersion(v) if v == "4"));
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unknown_transport_and_session() {
        let (engine, _accepted) = engine();
        let (req, _client) = request("carrier-pigeon", None);
        assert!(matches!(
            engine.handle(req).await,
            Err(RequestError::InvalidTransport(_))
        ));

        let (req, _client) = request("polling", Some("nope"));
        let err = engine.handle(req).await.unwrap_err();
        assert!(matches!(err, RequestError::InvalidSession(_)));
        assert_eq!(err.status_code(), 400);
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_session_cap() {
        let (engine, _accepted) = engine();
        for _ in 0..2 {
            let (req, _client) = request("polling", None);
            engine.handle(req).await.unwrap();
        }
        let (req, _client) = request("polling", None);
        let err = engine.handle(req).await.unwrap_err();
        assert!(matches!(err, RequestError::TooManySessions(2)));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn test_concurrent_opens_respect_cap() {
        let (engine, _accepted) = engine();
        let (requests, clients): (Vec<_>, Vec<_>) =
            (0..6).map(|_| request("polling", None)).unzip();

        let results =
            futures::future::join_all(requests.into_iter().map(|req| engine.handle(req))).await;
        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 2);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RequestError::TooManySessions(2))));
        assert_eq!(engine.sessions().len(), 2);
        drop(clients);
    }

    #[tokio::test]
    async fn test_upgrade_swaps_connection() {
        let (engine, mut accepted) = engine();
        let (req, old_client) = request("polling", None);
        engine.handle(req).await.unwrap();
        let session = accepted.recv().await.unwrap();
        old_client.read_packet().await.unwrap();

        let (req, new_client) = request("websocket", Some(session.id()));
        engine.handle(req).await.unwrap();
        assert_eq!(session.transport(), "websocket");
        assert_eq!(session.state(), SessionState::Active);

        session.write(Packet::message("after")).await.unwrap();
        let packet = new_client.read_packet().await.unwrap();
        assert_eq!(packet.payload, Payload::Text("after".into()));
    }

    #[tokio::test]
    async fn test_upgrade_to_unlisted_transport_is_rejected() {
        let (engine, mut accepted) = engine();
        engine.register(Arc::new(MemoryAcceptor::new("carrier-pigeon")));
        let (req, _client) = request("polling", None);
        engine.handle(req).await.unwrap();
        let session = accepted.recv().await.unwrap();

        let (req, _new) = request("carrier-pigeon", Some(session.id()));
        assert!(matches!(
            engine.handle(req).await,
            Err(RequestError::InvalidTransport(_))
        ));
        assert_eq!(session.transport(), "polling");
    }

    #[tokio::test]
    async fn test_failed_accept_leaves_session_active() {
        let (engine, mut accepted) = engine();
        let (req, _client) = request("polling", None);
        engine.handle(req).await.unwrap();
        let session = accepted.recv().await.unwrap();

        let mut query = HashMap::new();
        query.insert(QUERY_VERSION.to_string(), PROTOCOL_VERSION.to_string());
        query.insert(QUERY_TRANSPORT.to_string(), "websocket".to_string());
        query.insert(QUERY_SESSION.to_string(), session.id().to_string());
        let err = engine.handle(Request::new(query)).await.unwrap_err();
        assert!(matches!(err, RequestError::AcceptFailed(_)));
        assert_eq!(err.status_code(), 500);
        assert_eq!(session.transport(), "polling");
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_read_loop_answers_pings_and_ends_on_close() {
        let (engine, mut accepted) = engine();
        let (req, client) = request("websocket", None);
        engine.handle(req).await.unwrap();
        let session = accepted.recv().await.unwrap();
        client.read_packet().await.unwrap();

        let peer = async {
            client
                .write_packet(Packet::ping(Payload::Text("beat".into())))
                .await
                .unwrap();
            let pong = client.read_packet().await.unwrap();
            client.write_packet(Packet::message("hello")).await.unwrap();
            client.write_packet(Packet::close()).await.unwrap();
            pong
        };

        let mut messages = Vec::new();
        let ((), pong) = tokio::join!(
            engine.run_session(
                &session,
                |payload| {
                    messages.push(payload);
                    async {}
                },
                |_| {},
            ),
            peer,
        );

        assert_eq!(pong.kind, PacketKind::Pong);
        assert_eq!(pong.payload, Payload::Text("beat".into()));
        assert_eq!(messages, vec![Payload::Text("hello".into())]);
        assert!(session.is_closed());
        assert!(engine.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (engine, mut accepted) = engine();
        let (req, _client) = request("polling", None);
        engine.handle(req).await.unwrap();
        let session = accepted.recv().await.unwrap();

        tokio::join!(engine.close(), engine.close());
        engine.close().await;
        assert!(session.is_closed());
        assert!(engine.sessions().is_empty());

        let (req, _client) = request("polling", None);
        assert!(matches!(engine.handle(req).await, Err(RequestError::Shutdown)));
    }
}
