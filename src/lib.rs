//! # Tidewire Protocol
//!
//! Bidirectional, multiplexed real-time events over upgradeable transports.
//!
//! A session starts on a low-capability transport (request/response
//! polling) and can migrate to a persistent full-duplex one without losing
//! or duplicating packets. On top of the session, named namespaces carry
//! events with optional acknowledgements and binary attachments. It
//! provides:
//!
//! - **Upgrades**: Pause, swap and resume a session across transports
//! - **Multiplexing**: Independent namespaces over one session
//! - **Acknowledgements**: Request/response over a one-way event stream
//! - **Binary**: Raw attachments referenced from JSON arguments
//! - **Both roles**: Connecting client and accepting server
//!
//! Concrete transports plug in through [`transport::Connection`],
//! [`transport::Dialer`] and [`transport::Acceptor`]. An in-memory transport
//! ships in [`transport::memory`].
//!
//! ## Feature Flags
//!
//! - `transport` (default): Control packets, sessions, heartbeat, event layer
//! - `client` (default): Connecting role
//! - `server` (default): Accepting role
//!
//! ## Modules
//!
//! - [`core`]: Constants and error types (always included)
//! - [`transport`]: Transport layer (requires `transport` feature)
//! - [`event`]: Namespaces, events and acks (requires `transport` feature)
//! - [`client`]: Client API (requires `client` feature)
//! - [`server`]: Server API (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tidewire_protocol::prelude::*;
//! use tidewire_protocol::transport::memory::{MemoryAcceptor, MemoryDialer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let server = Server::new(ServerConfig::default());
//! server.register_transport(Arc::new(MemoryAcceptor::new("polling")));
//! server.on_event("/", "hello", |_socket, args| async move { Ok::<_, HandlerError>(args) });
//!
//! let (requests, incoming) = tokio::sync::mpsc::channel(16);
//! server.serve_requests(incoming);
//!
//! let config = ClientConfig::builder().url("memory://local/").build();
//! let client = Client::connect(config, &MemoryDialer::new("polling", requests)).await?;
//! let reply = client.emit_with_ack("/", "hello", vec!["world".into()]).await?.await?;
//! assert_eq!(reply, vec![Arg::from("world")]);
//!
//! client.close().await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Event layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod event;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core constants and errors
    pub use crate::core::*;

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        Acceptor, Connection, Dialer, Parameters, Request, Session, SessionState,
    };

    #[cfg(feature = "transport")]
    pub use crate::event::{AckReceiver, Arg, NamespaceSocket};

    #[cfg(feature = "client")]
    pub use crate::client::{Client, ClientBuilder, ClientConfig, ClientError};

    #[cfg(feature = "server")]
    pub use crate::server::{RequestError, Server, ServerConfig, ServerError};
}

// Re-export commonly used items at crate root
pub use core::{DecodeError, ProtocolError, TransportError};

#[cfg(feature = "transport")]
pub use event::Arg;
