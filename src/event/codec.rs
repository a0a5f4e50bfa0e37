//! Application packet codec with binary reassembly.
//!
//! An application packet with N attachments travels as one control
//! `message` packet carrying the metadata line, followed by N binary
//! `message` packets carrying the attachments in slot order.

use tracing::debug;

use super::packet::Packet;
use crate::core::DecodeError;
use crate::transport::{Packet as ControlPacket, Payload};

/// Encode an application packet into the control packets that carry it.
///
/// The returned packets must be written back to back.
pub fn encode(packet: &Packet) -> Vec<ControlPacket> {
    let mut out = Vec::with_capacity(1 + packet.attachments.len());
    out.push(ControlPacket::message(packet.encode_text()));
    out.extend(packet.attachments.iter().cloned().map(ControlPacket::binary));
    out
}

/// Streaming decoder for one session.
///
/// Binary packets are buffered until all declared attachments arrive.
#[derive(Debug, Default)]
pub struct Decoder {
    pending: Option<Packet>,
    discarded: Option<DecodeError>,
}

impl Decoder {
    /// Create an idle decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the payload of one control `message` packet.
    ///
    /// Returns `Ok(None)` while a binary packet is still waiting for
    /// attachments. A text frame arriving in that state replaces the
    /// incomplete packet; the loss is reported by [`take_discarded`](Self::take_discarded).
    pub fn add(&mut self, payload: Payload) -> Result<Option<Packet>, DecodeError> {
        match payload {
            Payload::Text(text) => {
                if let Some(stale) = self.pending.take() {
                    let missing = stale.attachment_count.saturating_sub(stale.attachments.len());
                    debug!(namespace = %stale.namespace, missing, "discarding incomplete binary packet");
                    self.discarded = Some(DecodeError::IncompleteBinary {
                        namespace: stale.namespace,
                        missing,
                    });
                }
                let packet = Packet::decode_text(&text)?;
                if packet.is_complete() {
                    Ok(Some(packet))
                } else {
                    self.pending = Some(packet);
                    Ok(None)
                }
            }
            Payload::Binary(bytes) => {
                let pending = self
                    .pending
                    .as_mut()
                    .ok_or(DecodeError::UnexpectedAttachment)?;
                pending.attachments.push(bytes);
                if pending.is_complete() {
                    Ok(self.pending.take())
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Take the error describing the last incomplete packet that a text
    /// frame displaced, if any.
    pub fn take_discarded(&mut self) -> Option<DecodeError> {
        self.discarded.take()
    }

    /// Check if a binary packet is waiting for attachments.
    pub fn is_buffering(&self) -> bool {
        self.pending.is_some()
    }
}
