//! Protocol constants for Tidewire.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed.
//! Defaults are only starting points for configuration.

use std::time::Duration;

// =============================================================================
// NEGOTIATION
// =============================================================================

/// Protocol version advertised in the `EIO` query value.
pub const PROTOCOL_VERSION: &str = "3";

/// Query key carrying the protocol version.
pub const QUERY_VERSION: &str = "EIO";

/// Query key carrying the requested transport name.
pub const QUERY_TRANSPORT: &str = "transport";

/// Query key carrying an existing session identifier.
pub const QUERY_SESSION: &str = "sid";

/// Transport name of the request/response polling channel.
pub const TRANSPORT_POLLING: &str = "polling";

/// Transport name of the persistent full-duplex channel.
pub const TRANSPORT_WEBSOCKET: &str = "websocket";

/// Length of generated session identifiers.
pub const SESSION_ID_LEN: usize = 20;

// =============================================================================
// NAMESPACES & ATTACHMENTS
// =============================================================================

/// Namespace used when a packet does not name one.
pub const ROOT_NAMESPACE: &str = "/";

/// Placeholder key marking a binary attachment slot.
pub const PLACEHOLDER_KEY: &str = "_placeholder";

/// Placeholder key carrying the attachment index.
pub const PLACEHOLDER_NUM: &str = "num";

// =============================================================================
// TIMING
// =============================================================================

/// Default interval between client pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);

/// Default time allowed for a ping to be answered.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default time allowed for dial + handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// CAPACITY
// =============================================================================

/// Default outbound queue capacity per accepting engine.
pub const DEFAULT_EMITTER_CAPACITY: usize = 64;

/// Default cap on concurrent sessions per accepting engine.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Channel depth for sessions awaiting the accept loop.
pub const ACCEPT_BACKLOG: usize = 16;
