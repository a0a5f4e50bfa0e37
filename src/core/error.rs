//! Error types for Tidewire protocol.

use std::io;

use thiserror::Error;

/// Errors raised while decoding control or application packets.
///
/// A decode error affects only the offending packet; the session stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame carried no bytes at all.
    #[error("empty frame")]
    EmptyFrame,

    /// Unknown control packet kind.
    #[error("unknown control packet kind: {0}")]
    UnknownControlKind(u8),

    /// Unknown application packet kind.
    #[error("unknown application packet kind: {0}")]
    UnknownPacketKind(u8),

    /// Attachment count prefix was malformed.
    #[error("invalid attachment count")]
    InvalidAttachmentCount,

    /// Acknowledgement id did not fit in 64 bits.
    #[error("invalid acknowledgement id")]
    InvalidAckId,

    /// Data section was not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// Raw attachment arrived with no binary packet waiting for it.
    #[error("unexpected binary attachment")]
    UnexpectedAttachment,

    /// A text frame arrived before a binary packet received all of its
    /// attachments. The incomplete packet was discarded.
    #[error("binary packet on {namespace:?} discarded with {missing} attachment(s) missing")]
    IncompleteBinary {
        /// Namespace of the discarded packet.
        namespace: String,
        /// Attachments that never arrived.
        missing: usize,
    },

    /// A placeholder referenced an attachment slot that does not exist.
    #[error("attachment placeholder {0} out of range")]
    MissingAttachment(usize),

    /// Event packet did not start with a string event name.
    #[error("event packet missing event name")]
    MissingEventName,

    /// Handshake payload did not describe session parameters.
    #[error("invalid handshake payload: {0}")]
    InvalidHandshake(String),
}

/// Transport errors.
///
/// These are terminal for the affected session: they drive it to `Closed`
/// and are never retried automatically.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O failure on the underlying channel.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A read or write missed its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The connection was closed by either side.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session is closed; no further writes are accepted.
    #[error("session closed")]
    SessionClosed,

    /// A frame could not be decoded at the transport boundary.
    #[error("frame error: {0}")]
    Frame(#[from] DecodeError),

    /// The transport could not serve the request.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Check if this error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Frame(_))
    }
}

/// Boxed error returned by application event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors delivered to the application error callback.
///
/// None of these terminate the engine.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed packet; it was dropped.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transport failure while sending a reply or event.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An event handler failed; no ack was sent.
    #[error("handler for '{event}' on '{namespace}' failed: {source}")]
    Handler {
        /// Namespace the event arrived on.
        namespace: String,
        /// Event name.
        event: String,
        /// Error returned by the handler.
        source: HandlerError,
    },

    /// The peer sent an `error` packet.
    #[error("remote error on '{namespace}': {data}")]
    Remote {
        /// Namespace the error arrived on.
        namespace: String,
        /// Error payload, verbatim.
        data: serde_json::Value,
    },

    /// Application packet kind outside the protocol's set.
    #[error("unknown packet kind: {0}")]
    UnknownPacket(u8),

    /// The session closed before the acknowledgement arrived.
    #[error("acknowledgement abandoned")]
    AckAbandoned,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
