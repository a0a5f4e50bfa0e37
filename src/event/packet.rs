//! Application packets.
//!
//! Text form, carried inside a control `message` packet:
//!
//! ```text
//! <kind>[<attachments>-][<namespace>,][<ack id>][<json data>]
//!
//! 2/chat,7["msg","hi"]                        event with ack id 7 on /chat
//! 51-["upload",{"_placeholder":true,"num":0}] binary event, one attachment
//! ```
//!
//! The namespace is omitted when it is `/`.

use std::fmt::Write;

use bytes::Bytes;
use serde_json::{Map, Value, json};

use crate::core::{DecodeError, PLACEHOLDER_KEY, PLACEHOLDER_NUM, ROOT_NAMESPACE};

/// Application packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Namespace attach.
    Connect = 0,
    /// Namespace detach.
    Disconnect = 1,
    /// Named event with arguments.
    Event = 2,
    /// Reply to an event.
    Ack = 3,
    /// Error report.
    Error = 4,
    /// Event whose arguments reference binary attachments.
    BinaryEvent = 5,
    /// Ack whose values reference binary attachments.
    BinaryAck = 6,
}

impl PacketKind {
    /// Parse a kind from its numeric value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Event),
            3 => Some(Self::Ack),
            4 => Some(Self::Error),
            5 => Some(Self::BinaryEvent),
            6 => Some(Self::BinaryAck),
            _ => None,
        }
    }

    /// Numeric value of the kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Check if packets of this kind carry attachments.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

/// One application argument or reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Any JSON value.
    Json(Value),
    /// Raw bytes, sent as an attachment.
    Binary(Bytes),
}

impl Arg {
    /// JSON value, if this is not binary.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Arg::Json(value) => Some(value),
            Arg::Binary(_) => None,
        }
    }

    /// String value, if this is a JSON string.
    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }

    /// Raw bytes, if this is binary.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Arg::Binary(bytes) => Some(bytes),
            Arg::Json(_) => None,
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Json(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Json(Value::String(value.to_string()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Json(Value::String(value))
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Arg::Binary(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Binary(Bytes::from(value))
    }
}

/// An application-layer packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Namespace, `/` by default.
    pub namespace: String,
    /// Acknowledgement id, present when the sender expects a reply.
    pub id: Option<u64>,
    /// JSON data; attachments appear as placeholder objects.
    pub data: Option<Value>,
    /// Declared number of attachments.
    pub attachment_count: usize,
    /// Attachments received or to be sent, in slot order.
    pub attachments: Vec<Bytes>,
}

impl Packet {
    fn bare(kind: PacketKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            id: None,
            data: None,
            attachment_count: 0,
            attachments: Vec::new(),
        }
    }

    /// Namespace attach packet.
    pub fn connect(namespace: impl Into<String>) -> Self {
        Self::bare(PacketKind::Connect, namespace)
    }

    /// Namespace detach packet.
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self::bare(PacketKind::Disconnect, namespace)
    }

    /// Error packet.
    pub fn error(namespace: impl Into<String>, data: Value) -> Self {
        let mut packet = Self::bare(PacketKind::Error, namespace);
        packet.data = Some(data);
        packet
    }

    /// Event packet; becomes a binary event if any argument is binary.
    pub fn event(
        namespace: impl Into<String>,
        event: &str,
        args: Vec<Arg>,
        id: Option<u64>,
    ) -> Self {
        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(Arg::from(event));
        values.extend(args);
        Self::with_values(PacketKind::Event, namespace, id, values)
    }

    /// Ack packet; becomes a binary ack if any value is binary.
    pub fn ack(namespace: impl Into<String>, id: u64, values: Vec<Arg>) -> Self {
        Self::with_values(PacketKind::Ack, namespace, Some(id), values)
    }

    fn with_values(
        kind: PacketKind,
        namespace: impl Into<String>,
        id: Option<u64>,
        values: Vec<Arg>,
    ) -> Self {
        let mut attachments = Vec::new();
        let data: Vec<Value> = values
            .into_iter()
            .map(|arg| match arg {
                Arg::Json(value) => value,
                Arg::Binary(bytes) => {
                    let slot = json!({ PLACEHOLDER_KEY: true, PLACEHOLDER_NUM: attachments.len() });
                    attachments.push(bytes);
                    slot
                }
            })
            .collect();

        let kind = match (kind, attachments.is_empty()) {
            (PacketKind::Event, false) => PacketKind::BinaryEvent,
            (PacketKind::Ack, false) => PacketKind::BinaryAck,
            (kind, _) => kind,
        };
        let mut packet = Self::bare(kind, namespace);
        packet.id = id;
        packet.data = Some(Value::Array(data));
        packet.attachment_count = attachments.len();
        packet.attachments = attachments;
        packet
    }

    /// Check if every declared attachment has arrived.
    pub fn is_complete(&self) -> bool {
        self.attachments.len() >= self.attachment_count
    }

    /// Data values with placeholders resolved to their attachments.
    pub fn args(&self) -> Result<Vec<Arg>, DecodeError> {
        let values = match &self.data {
            None => return Ok(Vec::new()),
            Some(Value::Array(values)) => values,
            Some(other) => return Ok(vec![Arg::Json(other.clone())]),
        };
        values
            .iter()
            .map(|value| match placeholder_slot(value) {
                Some(slot) => self
                    .attachments
                    .get(slot)
                    .cloned()
                    .map(Arg::Binary)
                    .ok_or(DecodeError::MissingAttachment(slot)),
                None => Ok(Arg::Json(value.clone())),
            })
            .collect()
    }

    /// Split event data into its name and arguments.
    pub fn event_args(&self) -> Result<(String, Vec<Arg>), DecodeError> {
        let mut args = self.args()?.into_iter();
        let name = match args.next() {
            Some(Arg::Json(Value::String(name))) => name,
            _ => return Err(DecodeError::MissingEventName),
        };
        Ok((name, args.collect()))
    }

    /// Encode the metadata line carried by the control `message` packet.
    pub fn encode_text(&self) -> String {
        let mut out = String::new();
        out.push(char::from(b'0' + self.kind.as_byte()));
        if self.kind.is_binary() {
            let _ = write!(out, "{}-", self.attachments.len());
        }
        if self.namespace != ROOT_NAMESPACE && !self.namespace.is_empty() {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.id {
            let _ = write!(out, "{id}");
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Decode a metadata line. Attachments, if any, arrive separately.
    pub fn decode_text(text: &str) -> Result<Self, DecodeError> {
        let first = *text.as_bytes().first().ok_or(DecodeError::EmptyFrame)?;
        let kind = first
            .checked_sub(b'0')
            .and_then(PacketKind::from_byte)
            .ok_or(DecodeError::UnknownPacketKind(first))?;
        let mut rest = &text[1..];

        let mut attachment_count = 0;
        if kind.is_binary() {
            let dash = rest.find('-').ok_or(DecodeError::InvalidAttachmentCount)?;
            attachment_count = rest[..dash]
                .parse()
                .map_err(|_| DecodeError::InvalidAttachmentCount)?;
            rest = &rest[dash + 1..];
        }

        let mut namespace = ROOT_NAMESPACE;
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    namespace = &rest[..comma];
                    rest = &rest[comma + 1..];
                }
                None => {
                    namespace = rest;
                    rest = "";
                }
            }
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|_| DecodeError::InvalidAckId)?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|e| DecodeError::InvalidJson(e.to_string()))?,
            )
        };

        Ok(Self {
            kind,
            namespace: namespace.to_string(),
            id,
            data,
            attachment_count,
            attachments: Vec::new(),
        })
    }
}

fn placeholder_slot(value: &Value) -> Option<usize> {
    let map: &Map<String, Value> = value.as_object()?;
    if map.get(PLACEHOLDER_KEY)?.as_bool()? {
        map.get(PLACEHOLDER_NUM)?
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
    } else {
        None
    }
}
