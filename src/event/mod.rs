//! Tidewire Protocol - Event Layer
//!
//! Namespaced events and acknowledgements multiplexed over one transport
//! session:
//!
//! - **Packets**: [`Packet`] text form and [`Arg`] values, with binary
//!   arguments carried as trailing attachments
//! - **Codec**: [`codec::encode`] and the reassembling [`Decoder`]
//! - **Namespaces**: [`NamespaceRegistry`] of event handlers
//! - **Acks**: [`AckCorrelator`] matching replies to pending emits
//! - **Dispatch**: [`Dispatcher`] routing complete packets for either role

mod ack;
pub mod codec;
mod dispatch;
mod namespace;
mod packet;
mod socket;

pub use ack::{AckCorrelator, AckReceiver};
pub use codec::Decoder;
pub use dispatch::{Callbacks, Dispatcher, ErrorCallback, Role, SocketCallback};
pub use namespace::{EventHandler, Namespace, NamespaceRegistry};
pub use packet::{Arg, Packet, PacketKind};
pub use socket::{DirectOutbound, NamespaceSocket, Outbound, Socket};
