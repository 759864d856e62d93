//! The OLSR packet container.
//!
//! Packets coalesce messages up to the available MTU; the host IP stack
//! handles UDP checksums and fragmentation, so the codec only enforces
//! the advertised-length rules.

use crate::decoder::MessageDecoder;
use crate::message::{CodecError, Message};
use crate::types::{IPV4_HEADER_SIZE, UDP_HEADER_SIZE};

/// Packet header: 16-bit length plus 16-bit sequence number.
pub const PACKET_HEADER_BYTES: usize = 4;

/// One OLSR packet: sequence number plus nested messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Packet {
    pub seqno: u16,
    /// Interface MTU bounding encoded size; 0 means unbounded.
    pub mtu: usize,
    pub messages: Vec<Message>,
}

impl Packet {
    pub fn new() -> Packet {
        Packet::default()
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Wire size of the full packet, ignoring any MTU bound.
    pub fn wire_len(&self) -> usize {
        PACKET_HEADER_BYTES + self.messages.iter().map(Message::wire_len).sum::<usize>()
    }

    /// Payload budget once IP and UDP headers are taken out of the MTU.
    pub fn mtu_bound(&self) -> usize {
        self.mtu.saturating_sub(IPV4_HEADER_SIZE + UDP_HEADER_SIZE)
    }

    /// Wire size that fits the MTU without splitting any message.
    pub fn bounded_len(&self) -> usize {
        if self.mtu == 0 {
            return self.wire_len();
        }
        let budget = self.mtu_bound();
        let mut len = PACKET_HEADER_BYTES;
        for message in &self.messages {
            let msg_len = message.wire_len();
            if len + msg_len > budget {
                break;
            }
            len += msg_len;
        }
        len
    }

    /// Encode the packet, packing as many whole messages as the MTU
    /// allows.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bounded = self.bounded_len();
        if self.mtu != 0 && !self.messages.is_empty() && bounded == PACKET_HEADER_BYTES {
            return Err(CodecError::MtuOverflow { mtu: self.mtu });
        }
        let mut buf = Vec::with_capacity(bounded);
        buf.extend_from_slice(&(bounded as u16).to_be_bytes());
        buf.extend_from_slice(&self.seqno.to_be_bytes());
        for message in &self.messages {
            if buf.len() + message.wire_len() > bounded {
                break;
            }
            message.encode(&mut buf);
        }
        Ok(buf)
    }

    /// Rewrite the sequence number of an already-encoded packet.
    pub fn update_encoded_seqno(buf: &mut [u8], seqno: u16) {
        if buf.len() >= PACKET_HEADER_BYTES {
            buf[2..4].copy_from_slice(&seqno.to_be_bytes());
        }
    }

    /// Decode a packet and every message it carries.
    ///
    /// A malformed message aborts the scan but keeps the messages decoded
    /// before it; a packet yielding no messages at all is invalid
    /// (RFC 3626 §3.4).
    pub fn decode(decoder: &MessageDecoder, buf: &[u8]) -> Result<Packet, CodecError> {
        if buf.len() <= PACKET_HEADER_BYTES {
            return Err(CodecError::PacketTooShort {
                actual: buf.len(),
                required: PACKET_HEADER_BYTES + 1,
            });
        }
        let advertised = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
        if buf.len() < advertised {
            return Err(CodecError::PacketTooShort {
                actual: buf.len(),
                required: advertised,
            });
        }
        let seqno = u16::from_be_bytes([buf[2], buf[3]]);

        let mut messages = Vec::new();
        let mut offset = PACKET_HEADER_BYTES;
        while offset < advertised {
            match decoder.decode(&buf[offset..advertised]) {
                Ok((message, consumed)) => {
                    messages.push(message);
                    offset += consumed;
                }
                Err(err) => {
                    log::debug!("stopping message scan at offset {offset}: {err}");
                    break;
                }
            }
        }

        if messages.is_empty() {
            return Err(CodecError::InvalidPacket(
                "packet contains no messages".to_string(),
            ));
        }
        if offset < advertised {
            log::debug!("packet has {} undecoded bytes", advertised - offset);
        }

        if let Some(first) = messages.first_mut() {
            first.is_first = true;
        }
        if let Some(last) = messages.last_mut() {
            last.is_last = true;
        }

        Ok(Packet {
            seqno,
            mtu: 0,
            messages,
        })
    }
}
