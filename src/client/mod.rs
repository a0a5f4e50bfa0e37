//! Tidewire Protocol - Client Library
//!
//! Connecting role: handshake, heartbeat, read loop and the high-level
//! [`Client`] API.

mod bootstrap;
#[allow(clippy::module_inception)]
mod client;

pub use bootstrap::*;
pub use client::*;
