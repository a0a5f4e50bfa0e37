//! Transport capabilities consumed by the protocol engine.
//!
//! Concrete transports (long-polling cycles, socket streams, TLS) live outside
//! this crate and plug in through [`Connection`], [`Dialer`] and [`Acceptor`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::packet::Packet;
use crate::core::{QUERY_SESSION, QUERY_TRANSPORT, QUERY_VERSION, TransportResult};

/// Request headers passed to a dialer or seen by an acceptor.
pub type Headers = BTreeMap<String, String>;

/// An opaque duplex packet channel supplied by a transport plugin.
///
/// Reads and writes may run concurrently from different tasks.
/// `read_packet` MUST be cancel-safe: dropping a pending read must not lose
/// a packet. A session drops pending reads when it closes or a read deadline
/// fires; a read in flight across a connection swap runs to completion.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Read the next control packet.
    async fn read_packet(&self) -> TransportResult<Packet>;

    /// Write one control packet.
    async fn write_packet(&self, packet: Packet) -> TransportResult<()>;

    /// Close the channel. Pending reads fail with `ConnectionClosed`.
    async fn close(&self) -> TransportResult<()>;

    /// Retire the channel after an upgrade.
    ///
    /// Request/response transports override this to finish an outstanding
    /// exchange before closing.
    async fn retire(&self) -> TransportResult<()> {
        self.close().await
    }

    /// Hand a follow-up request on the same transport to this connection.
    async fn serve(&self, request: Request) -> TransportResult<()> {
        let _ = request;
        Ok(())
    }
}

/// Connecting-role transport capability.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Name of the transport this dialer opens.
    fn transport_name(&self) -> &str;

    /// Open a connection to `url`.
    async fn dial(&self, url: &str, headers: &Headers) -> TransportResult<Arc<dyn Connection>>;
}

/// Accepting-role transport capability, one per transport kind.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Name matched against the `transport` query value.
    fn transport_name(&self) -> &str;

    /// Turn an incoming request into a connection.
    async fn accept(&self, request: &mut Request) -> TransportResult<Arc<dyn Connection>>;
}

/// An incoming request as seen by the accepting role.
///
/// `upgrade` carries transport-specific state (an upgraded socket, a
/// pending poll) that only the matching [`Acceptor`] knows how to use.
#[derive(Default)]
pub struct Request {
    /// Decoded query values.
    pub query: HashMap<String, String>,
    /// Request headers.
    pub headers: Headers,
    /// Transport-specific payload.
    pub upgrade: Option<Box<dyn Any + Send + Sync>>,
}

impl Request {
    /// Create a request from query values.
    pub fn new(query: HashMap<String, String>) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    /// Attach a transport-specific payload.
    pub fn with_upgrade<T: Any + Send + Sync>(mut self, upgrade: T) -> Self {
        self.upgrade = Some(Box::new(upgrade));
        self
    }

    /// Attach headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Look up a query value, treating empty values as absent.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Requested protocol version.
    pub fn protocol_version(&self) -> Option<&str> {
        self.query(QUERY_VERSION)
    }

    /// Requested transport name.
    pub fn transport(&self) -> Option<&str> {
        self.query(QUERY_TRANSPORT)
    }

    /// Session identifier, present when resuming or upgrading.
    pub fn session_id(&self) -> Option<&str> {
        self.query(QUERY_SESSION)
    }

    /// Take the transport-specific payload, if it has type `T`.
    pub fn take_upgrade<T: Any>(&mut self) -> Option<T> {
        match self.upgrade.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.upgrade = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}
