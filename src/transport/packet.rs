//! Control packet encoding and decoding.
//!
//! Every frame on a transport carries exactly one control packet:
//!
//! ```text
//! Text frame:    +-----------+----------------------+
//!                | kind '0'..| UTF-8 payload        |
//!                +-----------+----------------------+
//! Binary frame:  +-----------+----------------------+
//!                | kind 0..6 | raw bytes            |
//!                +-----------+----------------------+
//! ```

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::core::DecodeError;

/// Control packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Handshake from the accepting role, carries [`Parameters`].
    Open = 0,
    /// Graceful close.
    Close = 1,
    /// Liveness check.
    Ping = 2,
    /// Reply to a ping.
    Pong = 3,
    /// Wraps one application packet or attachment.
    Message = 4,
    /// Transport upgrade marker.
    Upgrade = 5,
    /// Does nothing.
    Noop = 6,
}

impl PacketKind {
    /// Parse a kind from its numeric value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Message),
            5 => Some(Self::Upgrade),
            6 => Some(Self::Noop),
            _ => None,
        }
    }

    /// Numeric value of the kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// ASCII digit used in text frames.
    pub fn as_digit(self) -> char {
        char::from(b'0' + self.as_byte())
    }
}

/// Packet payload, textual or raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Binary(Bytes),
}

impl Payload {
    /// Empty text payload.
    pub fn empty() -> Self {
        Payload::Text(String::new())
    }

    /// Check if the payload carries no data.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.is_empty(),
            Payload::Binary(bytes) => bytes.is_empty(),
        }
    }

    /// Check if the payload is raw bytes.
    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

/// A raw frame as exchanged with a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

/// A control-layer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Packet payload (may be empty).
    pub payload: Payload,
}

impl Packet {
    /// Create a packet.
    pub fn new(kind: PacketKind, payload: Payload) -> Self {
        Self { kind, payload }
    }

    /// Create an `open` packet carrying handshake parameters.
    pub fn open(params: &Parameters) -> Self {
        // Parameters contain only strings and integers.
        let text = serde_json::to_string(params).unwrap_or_default();
        Self::new(PacketKind::Open, Payload::Text(text))
    }

    /// Create a `close` packet.
    pub fn close() -> Self {
        Self::new(PacketKind::Close, Payload::empty())
    }

    /// Create a `ping` packet.
    pub fn ping(payload: Payload) -> Self {
        Self::new(PacketKind::Ping, payload)
    }

    /// Create a `pong` packet.
    pub fn pong(payload: Payload) -> Self {
        Self::new(PacketKind::Pong, payload)
    }

    /// Create a textual `message` packet.
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(PacketKind::Message, Payload::Text(text.into()))
    }

    /// Create a binary `message` packet (one attachment).
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Self::new(PacketKind::Message, Payload::Binary(bytes.into()))
    }

    /// Create a `noop` packet.
    pub fn noop() -> Self {
        Self::new(PacketKind::Noop, Payload::empty())
    }

    /// Encode into a frame.
    pub fn encode(&self) -> Frame {
        match &self.payload {
            Payload::Text(text) => {
                let mut out = String::with_capacity(1 + text.len());
                out.push(self.kind.as_digit());
                out.push_str(text);
                Frame::Text(out)
            }
            Payload::Binary(bytes) => {
                let mut out = BytesMut::with_capacity(1 + bytes.len());
                out.put_u8(self.kind.as_byte());
                out.put_slice(bytes);
                Frame::Binary(out.freeze())
            }
        }
    }

    /// Decode a frame.
    pub fn decode(frame: Frame) -> Result<Self, DecodeError> {
        match frame {
            Frame::Text(text) => {
                let first = *text.as_bytes().first().ok_or(DecodeError::EmptyFrame)?;
                let kind = first
                    .checked_sub(b'0')
                    .and_then(PacketKind::from_byte)
                    .ok_or(DecodeError::UnknownControlKind(first))?;
                // The kind digit is ASCII, so index 1 is a char boundary.
                Ok(Self::new(kind, Payload::Text(text[1..].to_string())))
            }
            Frame::Binary(bytes) => {
                let first = *bytes.first().ok_or(DecodeError::EmptyFrame)?;
                let kind =
                    PacketKind::from_byte(first).ok_or(DecodeError::UnknownControlKind(first))?;
                Ok(Self::new(kind, Payload::Binary(bytes.slice(1..))))
            }
        }
    }
}

/// Handshake-negotiated session parameters.
///
/// Immutable once the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Session identifier assigned by the accepting role.
    #[serde(rename = "sid")]
    pub session_id: String,
    /// Transports the accepting role will upgrade to.
    pub upgrades: Vec<String>,
    /// Interval between pings, in milliseconds.
    #[serde(rename = "pingInterval")]
    pub ping_interval_ms: u64,
    /// Time allowed for a ping round trip, in milliseconds.
    #[serde(rename = "pingTimeout")]
    pub ping_timeout_ms: u64,
}

impl Parameters {
    /// Ping interval as a duration.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Ping timeout as a duration.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Extract parameters from a handshake packet.
    pub fn from_packet(packet: &Packet) -> Result<Self, DecodeError> {
        if packet.kind != PacketKind::Open {
            return Err(DecodeError::InvalidHandshake(format!(
                "expected open packet, got {:?}",
                packet.kind
            )));
        }
        let bytes: &[u8] = match &packet.payload {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        };
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidHandshake(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kind_roundtrip() {
        for byte in 0..=6 {
            let kind = PacketKind::from_byte(byte).unwrap();
            assert_eq!(kind.as_byte(), byte);
        }
        assert!(PacketKind::from_byte(7).is_none());
        assert_eq!(PacketKind::Message.as_digit(), '4');
    }

    #[test]
    fn test_text_frame_encoding() {
        let frame = Packet::message("2[\"msg\"]").encode();
        assert_eq!(frame, Frame::Text("42[\"msg\"]".into()));

        let frame = Packet::ping(Payload::Text("beat".into())).encode();
        assert_eq!(frame, Frame::Text("2beat".into()));
    }

    #[test]
    fn test_binary_frame_encoding() {
        let frame = Packet::binary(vec![1u8, 2, 3]).encode();
        assert_eq!(frame, Frame::Binary(Bytes::from_static(&[4, 1, 2, 3])));

        let decoded = Packet::decode(frame).unwrap();
        assert_eq!(decoded.kind, PacketKind::Message);
        assert_eq!(decoded.payload, Payload::Binary(Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn test_decode_empty_payload() {
        let packet = Packet::decode(Frame::Text("3".into())).unwrap();
        assert_eq!(packet.kind, PacketKind::Pong);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            Packet::decode(Frame::Text(String::new())),
            Err(DecodeError::EmptyFrame)
        );
        assert_eq!(
            Packet::decode(Frame::Text("9x".into())),
            Err(DecodeError::UnknownControlKind(b'9'))
        );
        assert_eq!(
            Packet::decode(Frame::Binary(Bytes::from_static(&[42]))),
            Err(DecodeError::UnknownControlKind(42))
        );
    }

    #[test]
    fn test_parameters_wire_names() {
        let params = Parameters {
            session_id: "abc123".into(),
            upgrades: vec!["websocket".into()],
            ping_interval_ms: 25_000,
            ping_timeout_ms: 5_000,
        };
        let packet = Packet::open(&params);
        let Payload::Text(text) = &packet.payload else {
            panic!("open payload must be text");
        };
        assert!(text.contains("\"sid\":\"abc123\""));
        assert!(text.contains("\"pingInterval\":25000"));

        let parsed = Parameters::from_packet(&packet).unwrap();
        assert_eq!(parsed, params);
        assert_eq!(parsed.ping_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parameters_reject_non_open() {
        let err = Parameters::from_packet(&Packet::noop()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidHandshake(_)));
    }
}
