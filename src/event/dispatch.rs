//! Routing of complete application packets.
//!
//! Handlers run on the session's read loop, so packets from one session are
//! processed in arrival order. A handler that awaits an acknowledgement from
//! the same peer must spawn that wait, otherwise the reply can never be read.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::namespace::NamespaceRegistry;
use super::packet::{Packet, PacketKind};
use super::socket::{NamespaceSocket, Socket};
use crate::core::{DecodeError, ProtocolError, ROOT_NAMESPACE};
use crate::transport::Payload;

/// Callback receiving a namespace-scoped socket.
pub type SocketCallback = Arc<dyn Fn(NamespaceSocket) + Send + Sync>;

/// Callback receiving asynchronous failures.
pub type ErrorCallback = Arc<dyn Fn(ProtocolError) + Send + Sync>;

/// Engine-level callback slots.
#[derive(Default)]
pub struct Callbacks {
    connect: RwLock<Option<SocketCallback>>,
    disconnect: RwLock<Option<SocketCallback>>,
    error: RwLock<Option<ErrorCallback>>,
}

impl Callbacks {
    /// Set the namespace connect callback.
    pub fn set_connect(&self, callback: SocketCallback) {
        *self.connect.write() = Some(callback);
    }

    /// Set the namespace disconnect callback.
    pub fn set_disconnect(&self, callback: SocketCallback) {
        *self.disconnect.write() = Some(callback);
    }

    /// Set the error callback.
    pub fn set_error(&self, callback: ErrorCallback) {
        *self.error.write() = Some(callback);
    }

    fn fire_connect(&self, socket: NamespaceSocket) {
        let callback = self.connect.read().clone();
        if let Some(callback) = callback {
            callback(socket);
        }
    }

    fn fire_disconnect(&self, socket: NamespaceSocket) {
        let callback = self.disconnect.read().clone();
        if let Some(callback) = callback {
            callback(socket);
        }
    }

    /// Deliver `error` to the error callback, or log it if none is set.
    pub fn fire_error(&self, error: ProtocolError) {
        let callback = self.error.read().clone();
        match callback {
            Some(callback) => callback(error),
            None => debug!(%error, "unhandled protocol error"),
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("connect", &self.connect.read().is_some())
            .field("disconnect", &self.disconnect.read().is_some())
            .field("error", &self.error.read().is_some())
            .finish()
    }
}

/// Which side of the protocol a dispatcher serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials out and waits for the peer to confirm namespaces.
    Connecting,
    /// Accepts sessions and confirms namespace joins.
    Accepting,
}

/// Routes application packets to namespaces, handlers and ack waiters.
#[derive(Debug)]
pub struct Dispatcher {
    role: Role,
    namespaces: NamespaceRegistry,
    callbacks: Callbacks,
}

impl Dispatcher {
    /// Create a dispatcher for `role`.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            namespaces: NamespaceRegistry::new(),
            callbacks: Callbacks::default(),
        }
    }

    /// Role served.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Namespace registry.
    pub fn namespaces(&self) -> &NamespaceRegistry {
        &self.namespaces
    }

    /// Callback slots.
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Session opened. The accepting role attaches the root namespace and
    /// confirms it to the peer.
    pub async fn on_open(&self, socket: &Arc<Socket>) {
        if self.role != Role::Accepting {
            return;
        }
        socket.attach(ROOT_NAMESPACE);
        if let Err(e) = socket.send(&Packet::connect(ROOT_NAMESPACE)).await {
            self.callbacks.fire_error(e.into());
            return;
        }
        self.callbacks
            .fire_connect(NamespaceSocket::new(Arc::clone(socket), ROOT_NAMESPACE));
    }

    /// Feed the payload of one control `message` packet.
    pub async fn on_message(&self, socket: &Arc<Socket>, payload: Payload) {
        let decoded = socket.decode(payload);
        if let Some(discarded) = socket.take_discarded() {
            self.callbacks.fire_error(discarded.into());
        }
        match decoded {
            Ok(Some(packet)) => self.process(socket, packet).await,
            Ok(None) => {}
            Err(DecodeError::UnknownPacketKind(kind)) => {
                self.callbacks.fire_error(ProtocolError::UnknownPacket(kind));
            }
            Err(e) => self.callbacks.fire_error(e.into()),
        }
    }

    /// Session ended. Outstanding acks are abandoned and every attached
    /// namespace sees a disconnect.
    pub fn on_close(&self, socket: &Arc<Socket>) {
        socket.acks().abandon_all();
        for namespace in socket.detach_all() {
            self.callbacks
                .fire_disconnect(NamespaceSocket::new(Arc::clone(socket), namespace));
        }
    }

    /// Route one complete application packet.
    pub async fn process(&self, socket: &Arc<Socket>, packet: Packet) {
        let Some(namespace) = self.namespaces.get(&packet.namespace) else {
            debug!(sid = %socket.session_id(), namespace = %packet.namespace, "dropping packet for unknown namespace");
            return;
        };
        trace!(sid = %socket.session_id(), namespace = %packet.namespace, kind = ?packet.kind, "dispatch");
        let scoped = NamespaceSocket::new(Arc::clone(socket), packet.namespace.clone());

        match packet.kind {
            PacketKind::Connect => {
                if !socket.attach(&packet.namespace) {
                    trace!(namespace = %packet.namespace, "already attached");
                    return;
                }
                if self.role == Role::Accepting {
                    if let Err(e) = socket.send(&Packet::connect(packet.namespace.clone())).await {
                        self.callbacks.fire_error(e.into());
                        return;
                    }
                }
                self.callbacks.fire_connect(scoped);
            }
            PacketKind::Disconnect => {
                if socket.detach(&packet.namespace) {
                    self.callbacks.fire_disconnect(scoped);
                }
            }
            PacketKind::Event | PacketKind::BinaryEvent => {
                let (event, args) = match packet.event_args() {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        self.callbacks.fire_error(e.into());
                        return;
                    }
                };
                let Some(handler) = namespace.handler(&event) else {
                    trace!(namespace = %packet.namespace, %event, "no handler");
                    return;
                };
                // The call sits inside the async block so a panic raised
                // before the handler's first await is caught too.
                let outcome = AssertUnwindSafe(async { handler(scoped, args).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_message(panic).into()));
                let values = match outcome {
                    Ok(values) => values,
                    Err(source) => {
                        self.callbacks.fire_error(ProtocolError::Handler {
                            namespace: packet.namespace,
                            event,
                            source,
                        });
                        return;
                    }
                };
                if let Some(id) = packet.id {
                    if let Err(e) = socket.send(&Packet::ack(packet.namespace, id, values)).await {
                        self.callbacks.fire_error(e.into());
                    }
                }
            }
            PacketKind::Ack | PacketKind::BinaryAck => {
                let Some(id) = packet.id else {
                    return;
                };
                let values = match packet.args() {
                    Ok(values) => values,
                    Err(e) => {
                        self.callbacks.fire_error(e.into());
                        return;
                    }
                };
                if !socket.acks().fulfill(id, values) {
                    debug!(sid = %socket.session_id(), id, "dropping unmatched ack");
                }
            }
            PacketKind::Error => {
                self.callbacks.fire_error(ProtocolError::Remote {
                    namespace: packet.namespace,
                    data: packet.data.unwrap_or_default(),
                });
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("handler panicked: {detail}")
}
