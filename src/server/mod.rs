//! Tidewire Protocol - Server Library
//!
//! Accepting role: request negotiation, transport upgrades, the outbound
//! emitter and the high-level [`Server`] API.

mod emitter;
mod engine;
#[allow(clippy::module_inception)]
mod server;
mod session;

pub use emitter::Emitter;
pub use engine::EngineServer;
pub use server::*;
pub use session::*;
