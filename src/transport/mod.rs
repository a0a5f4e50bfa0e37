//! Tidewire Protocol - Transport Layer
//!
//! This module owns everything below the application event layer:
//!
//! - **Control packets**: [`Packet`], [`PacketKind`] and the frame codec
//! - **Capabilities**: [`Connection`], [`Dialer`], [`Acceptor`] implemented by
//!   transport plugins
//! - **Sessions**: [`Session`] with the pause/swap/resume upgrade state machine
//! - **Heartbeat**: [`Heartbeat`] pings and read/write deadlines
//! - **In-memory pipe**: [`memory`] for tests and single-process setups
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Namespaces, events, acknowledgements  │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │  control packets, sessions, heartbeat   │
//! ├─────────────────────────────────────────┤
//! │   polling / websocket / memory plugin   │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod heartbeat;
pub mod memory;
mod packet;
mod session;

pub use connection::*;
pub use heartbeat::Heartbeat;
pub use packet::*;
pub use session::*;
