//! Per-session application state and namespace-scoped handles.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::ack::{AckCorrelator, AckReceiver};
use super::codec::{self, Decoder};
use super::packet::{Arg, Packet};
use crate::core::{DecodeError, TransportError, TransportResult};
use crate::transport::{Packet as ControlPacket, Payload, Session};

/// Where encoded packets go on their way to a session's connection.
///
/// Implementations must write each call's packets contiguously and keep
/// calls for the same session in order.
#[async_trait]
pub trait Outbound: Send + Sync + 'static {
    /// Send a group of control packets to `session`.
    async fn send(&self, session: &Arc<Session>, packets: Vec<ControlPacket>) -> TransportResult<()>;
}

/// Writes straight to the session. Used by the connecting role, which owns
/// exactly one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectOutbound;

#[async_trait]
impl Outbound for DirectOutbound {
    async fn send(&self, session: &Arc<Session>, packets: Vec<ControlPacket>) -> TransportResult<()> {
        session.write_all(packets).await
    }
}

/// Application state bound to one transport session.
pub struct Socket {
    session: Arc<Session>,
    outbound: Arc<dyn Outbound>,
    decoder: Mutex<Decoder>,
    acks: AckCorrelator,
    attached: Mutex<BTreeSet<String>>,
}

impl Socket {
    /// Bind application state to `session`.
    pub fn new(session: Arc<Session>, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            session,
            outbound,
            decoder: Mutex::new(Decoder::new()),
            acks: AckCorrelator::new(),
            attached: Mutex::new(BTreeSet::new()),
        }
    }

    /// Session identifier.
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Underlying transport session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Pending acknowledgements.
    pub fn acks(&self) -> &AckCorrelator {
        &self.acks
    }

    /// Encode and send one application packet.
    pub async fn send(&self, packet: &Packet) -> TransportResult<()> {
        if self.session.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        trace!(sid = %self.session_id(), namespace = %packet.namespace, kind = ?packet.kind, "send");
        self.outbound.send(&self.session, codec::encode(packet)).await
    }

    /// Emit an event without expecting a reply.
    pub async fn emit(&self, namespace: &str, event: &str, args: Vec<Arg>) -> TransportResult<()> {
        self.send(&Packet::event(namespace, event, args, None)).await
    }

    /// Emit an event and register a waiter for its acknowledgement.
    pub async fn emit_with_ack(
        &self,
        namespace: &str,
        event: &str,
        args: Vec<Arg>,
    ) -> TransportResult<AckReceiver> {
        if self.session.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let rx = self.acks.register();
        let packet = Packet::event(namespace, event, args, Some(rx.id()));
        if let Err(e) = self.send(&packet).await {
            self.acks.cancel(rx.id());
            return Err(e);
        }
        Ok(rx)
    }

    /// Feed one inbound `message` payload to the decoder.
    pub fn decode(&self, payload: Payload) -> Result<Option<Packet>, DecodeError> {
        self.decoder.lock().add(payload)
    }

    /// Error for an incomplete binary packet the last text frame displaced.
    pub fn take_discarded(&self) -> Option<DecodeError> {
        self.decoder.lock().take_discarded()
    }

    /// Check if `namespace` is attached.
    pub fn is_attached(&self, namespace: &str) -> bool {
        self.attached.lock().contains(namespace)
    }

    /// Mark `namespace` attached. Returns `false` if it already was.
    pub fn attach(&self, namespace: &str) -> bool {
        self.attached.lock().insert(namespace.to_string())
    }

    /// Mark `namespace` detached. Returns `false` if it was not attached.
    pub fn detach(&self, namespace: &str) -> bool {
        self.attached.lock().remove(namespace)
    }

    /// Detach every namespace, returning their names.
    pub fn detach_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.attached.lock())
            .into_iter()
            .collect()
    }

    /// Attached namespaces.
    pub fn namespaces(&self) -> Vec<String> {
        self.attached.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("session", &self.session)
            .field("attached", &*self.attached.lock())
            .field("pending_acks", &self.acks.pending_len())
            .finish()
    }
}

/// A socket scoped to one namespace, handed to application callbacks.
#[derive(Debug, Clone)]
pub struct NamespaceSocket {
    socket: Arc<Socket>,
    namespace: String,
}

impl NamespaceSocket {
    /// Scope `socket` to `namespace`.
    pub fn new(socket: Arc<Socket>, namespace: impl Into<String>) -> Self {
        Self {
            socket,
            namespace: namespace.into(),
        }
    }

    /// Namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Session identifier.
    pub fn session_id(&self) -> &str {
        self.socket.session_id()
    }

    /// The unscoped socket.
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Emit an event on this namespace.
    pub async fn emit(&self, event: &str, args: Vec<Arg>) -> TransportResult<()> {
        self.socket.emit(&self.namespace, event, args).await
    }

    /// Emit an event on this namespace and wait for its acknowledgement.
    pub async fn emit_with_ack(&self, event: &str, args: Vec<Arg>) -> TransportResult<AckReceiver> {
        self.socket.emit_with_ack(&self.namespace, event, args).await
    }

    /// Detach from this namespace and tell the peer.
    pub async fn disconnect(&self) -> TransportResult<()> {
        self.socket.detach(&self.namespace);
        self.socket.send(&Packet::disconnect(self.namespace.clone())).await
    }
}
