//! Typed OLSR messages and their wire forms.

use std::net::Ipv4Addr;

use ridgeline_event::TimeVal;
use ridgeline_net::{ipv4_netmask, ipv4_mask_len, Ipv4Net, RouteAddress};

use crate::link_code::LinkCode;
use crate::types::{
    WillType, HELLO_MESSAGE, HNA_MESSAGE, LQ_HELLO_MESSAGE, LQ_TC_MESSAGE, MID_MESSAGE,
    TC_MESSAGE,
};
use crate::vtime;

/// Common message header size for the IPv4 family.
pub const MESSAGE_HEADER_BYTES: usize = 12;

/// Link tuple header: code, reserved, tuple size.
pub const LINK_TUPLE_HEADER_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("packet too short: {actual} bytes, need {required}")]
    PacketTooShort { actual: usize, required: usize },

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid link tuple: {0}")]
    InvalidLinkTuple(String),

    #[error("message does not fit the {mtu}-byte MTU budget")]
    MtuOverflow { mtu: usize },
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn get_ipv4(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
}

/// Per-address information in HELLO link tuples and TC neighbor lists.
///
/// ETX measurements ride along as two extra bytes per address in the
/// link-quality message variants, encoded as `value / 255` to match
/// olsrd.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkAddrInfo {
    pub addr: Ipv4Addr,
    pub near_etx: f64,
    pub far_etx: f64,
}

impl LinkAddrInfo {
    pub fn new(addr: Ipv4Addr) -> LinkAddrInfo {
        LinkAddrInfo {
            addr,
            near_etx: 0.0,
            far_etx: 0.0,
        }
    }

    pub fn with_etx(addr: Ipv4Addr, near_etx: f64, far_etx: f64) -> LinkAddrInfo {
        LinkAddrInfo {
            addr,
            near_etx,
            far_etx,
        }
    }

    fn wire_len(has_etx: bool) -> usize {
        if has_etx {
            Ipv4Addr::ADDR_BYTELEN + 2
        } else {
            Ipv4Addr::ADDR_BYTELEN
        }
    }

    fn decode(buf: &[u8], has_etx: bool) -> LinkAddrInfo {
        let addr = get_ipv4(buf, 0);
        if has_etx {
            LinkAddrInfo {
                addr,
                near_etx: f64::from(buf[4]) / 255.0,
                far_etx: f64::from(buf[5]) / 255.0,
            }
        } else {
            LinkAddrInfo::new(addr)
        }
    }

    fn encode(&self, buf: &mut Vec<u8>, has_etx: bool) {
        self.addr.to_wire(buf);
        if has_etx {
            buf.push((self.near_etx * 255.0).round() as u8);
            buf.push((self.far_etx * 255.0).round() as u8);
        }
    }
}

/// A HELLO link tuple: one link code and the neighbor interface
/// addresses it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkTuple {
    pub code: LinkCode,
    pub addrs: Vec<LinkAddrInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelloBody {
    pub htime: TimeVal,
    pub willingness: WillType,
    pub links: Vec<LinkTuple>,
    /// True for the LQ-HELLO variant carrying ETX bytes per address.
    pub etx: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcBody {
    pub ansn: u16,
    pub neighbors: Vec<LinkAddrInfo>,
    /// True for the LQ-TC variant carrying ETX bytes per neighbor.
    pub etx: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MidBody {
    pub interfaces: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HnaBody {
    pub networks: Vec<Ipv4Net>,
}

/// An unrecognized message kept as raw bytes (header included) so it can
/// be forwarded verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownBody {
    pub type_code: u8,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Hello(HelloBody),
    Tc(TcBody),
    Mid(MidBody),
    Hna(HnaBody),
    Unknown(UnknownBody),
}

impl MessageBody {
    pub fn type_code(&self) -> u8 {
        match self {
            MessageBody::Hello(h) if h.etx => LQ_HELLO_MESSAGE,
            MessageBody::Hello(_) => HELLO_MESSAGE,
            MessageBody::Tc(t) if t.etx => LQ_TC_MESSAGE,
            MessageBody::Tc(_) => TC_MESSAGE,
            MessageBody::Mid(_) => MID_MESSAGE,
            MessageBody::Hna(_) => HNA_MESSAGE,
            MessageBody::Unknown(u) => u.type_code,
        }
    }

    fn wire_len(&self) -> usize {
        match self {
            MessageBody::Hello(h) => {
                let mut len = 4;
                for tuple in &h.links {
                    if tuple.addrs.is_empty() {
                        continue;
                    }
                    len += LINK_TUPLE_HEADER_BYTES
                        + tuple.addrs.len() * LinkAddrInfo::wire_len(h.etx);
                }
                len
            }
            MessageBody::Tc(t) => 4 + t.neighbors.len() * LinkAddrInfo::wire_len(t.etx),
            MessageBody::Mid(m) => m.interfaces.len() * Ipv4Addr::ADDR_BYTELEN,
            MessageBody::Hna(h) => h.networks.len() * 2 * Ipv4Addr::ADDR_BYTELEN,
            MessageBody::Unknown(u) => u.raw.len().saturating_sub(MESSAGE_HEADER_BYTES),
        }
    }
}

/// One OLSR protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Validity time from the 8-bit compressed field.
    pub validity: TimeVal,
    pub origin: Ipv4Addr,
    pub ttl: u8,
    pub hops: u8,
    pub seqno: u16,
    /// Position flags within the containing packet; secured-OLSR
    /// processing depends on them.
    pub is_first: bool,
    pub is_last: bool,
    pub body: MessageBody,
}

impl Message {
    pub fn new(body: MessageBody) -> Message {
        Message {
            validity: TimeVal::ZERO,
            origin: Ipv4Addr::UNSPECIFIED,
            ttl: crate::types::MAX_TTL,
            hops: 0,
            seqno: 0,
            is_first: false,
            is_last: false,
            body,
        }
    }

    pub fn type_code(&self) -> u8 {
        self.body.type_code()
    }

    /// Total on-wire length, common header included.
    pub fn wire_len(&self) -> usize {
        match &self.body {
            MessageBody::Unknown(u) => u.raw.len(),
            body => MESSAGE_HEADER_BYTES + body.wire_len(),
        }
    }

    /// Append the encoded message. Unknown messages are re-emitted
    /// verbatim from their captured bytes.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if let MessageBody::Unknown(u) = &self.body {
            buf.extend_from_slice(&u.raw);
            return;
        }

        buf.push(self.type_code());
        buf.push(vtime::from_timeval(self.validity));
        put_u16(buf, self.wire_len() as u16);
        self.origin.to_wire(buf);
        buf.push(self.ttl);
        buf.push(self.hops);
        put_u16(buf, self.seqno);

        match &self.body {
            MessageBody::Hello(h) => encode_hello(h, buf),
            MessageBody::Tc(t) => encode_tc(t, buf),
            MessageBody::Mid(m) => {
                for addr in &m.interfaces {
                    addr.to_wire(buf);
                }
            }
            MessageBody::Hna(h) => {
                for net in &h.networks {
                    net.masked_addr().to_wire(buf);
                    ipv4_netmask(net.prefix_len()).to_wire(buf);
                }
            }
            MessageBody::Unknown(_) => unreachable!("handled above"),
        }
    }
}

fn encode_hello(h: &HelloBody, buf: &mut Vec<u8>) {
    put_u16(buf, 0); // reserved
    buf.push(vtime::from_timeval(h.htime));
    buf.push(h.willingness);
    for tuple in &h.links {
        // a tuple with no neighbors would be dead weight on the wire
        if tuple.addrs.is_empty() {
            continue;
        }
        let size =
            LINK_TUPLE_HEADER_BYTES + tuple.addrs.len() * LinkAddrInfo::wire_len(h.etx);
        buf.push(tuple.code.as_byte());
        buf.push(0); // reserved
        put_u16(buf, size as u16);
        for addr in &tuple.addrs {
            addr.encode(buf, h.etx);
        }
    }
}

fn encode_tc(t: &TcBody, buf: &mut Vec<u8>) {
    put_u16(buf, t.ansn);
    put_u16(buf, 0); // reserved
    for neighbor in &t.neighbors {
        neighbor.encode(buf, t.etx);
    }
}

// ---------------------------------------------------------------------------
// Decoding

/// The fields every message shares, as read off the wire.
pub struct CommonHeader {
    pub type_code: u8,
    pub validity: TimeVal,
    pub size: usize,
    pub origin: Ipv4Addr,
    pub ttl: u8,
    pub hops: u8,
    pub seqno: u16,
}

pub(crate) fn decode_common_header(buf: &[u8]) -> Result<CommonHeader, CodecError> {
    if buf.len() < MESSAGE_HEADER_BYTES {
        return Err(CodecError::InvalidMessage(format!(
            "message too short: {} bytes, need {}",
            buf.len(),
            MESSAGE_HEADER_BYTES
        )));
    }
    let size = usize::from(get_u16(buf, 2));
    if size > buf.len() {
        return Err(CodecError::InvalidMessage(format!(
            "message advertises {size} bytes but only {} remain",
            buf.len()
        )));
    }
    if size < MESSAGE_HEADER_BYTES {
        return Err(CodecError::InvalidMessage(format!(
            "message advertises {size} bytes, less than its own header"
        )));
    }
    let ttl = buf[8];
    if ttl == 0 {
        return Err(CodecError::InvalidMessage("zero TTL".to_string()));
    }
    Ok(CommonHeader {
        type_code: buf[0],
        validity: vtime::to_timeval(buf[1]),
        size,
        origin: get_ipv4(buf, 4),
        ttl,
        hops: buf[9],
        seqno: get_u16(buf, 10),
    })
}

fn message_from_header(header: &CommonHeader, body: MessageBody) -> Message {
    Message {
        validity: header.validity,
        origin: header.origin,
        ttl: header.ttl,
        hops: header.hops,
        seqno: header.seqno,
        is_first: false,
        is_last: false,
        body,
    }
}

/// Decode one link tuple; returns the tuple (if its link code was
/// meaningful) and the bytes consumed.
fn decode_link_tuple(
    body: &[u8],
    has_etx: bool,
) -> Result<(Option<LinkTuple>, usize), CodecError> {
    if body.len() < LINK_TUPLE_HEADER_BYTES {
        return Err(CodecError::InvalidLinkTuple(format!(
            "runt link tuple, {} bytes left",
            body.len()
        )));
    }
    let code_byte = body[0];
    let tuple_len = usize::from(get_u16(body, 2));
    if tuple_len < LINK_TUPLE_HEADER_BYTES || tuple_len > body.len() {
        return Err(CodecError::InvalidLinkTuple(format!(
            "advertised size {tuple_len}, buffer size {}",
            body.len()
        )));
    }

    let code = match LinkCode::from_byte(code_byte) {
        Ok(code) => code,
        Err(err) => {
            // discarded silently per RFC 3626, but the bytes are consumed
            log::debug!("skipping link tuple: {err}");
            return Ok((None, tuple_len));
        }
    };

    let record_len = LinkAddrInfo::wire_len(has_etx);
    let mut addrs = Vec::new();
    let mut offset = LINK_TUPLE_HEADER_BYTES;
    while tuple_len - offset >= record_len {
        addrs.push(LinkAddrInfo::decode(&body[offset..], has_etx));
        offset += record_len;
    }
    if offset != tuple_len {
        log::warn!("link tuple has {} unparsed bytes", tuple_len - offset);
    }
    Ok((Some(LinkTuple { code, addrs }), tuple_len))
}

pub(crate) fn decode_hello(
    header: &CommonHeader,
    body: &[u8],
    has_etx: bool,
) -> Result<Message, CodecError> {
    if body.len() < 4 {
        return Err(CodecError::InvalidMessage(format!(
            "runt HELLO, body is {} bytes",
            body.len()
        )));
    }
    let htime = vtime::to_timeval(body[2]);
    let willingness = body[3];

    let mut links = Vec::new();
    let mut offset = 4;
    while offset < body.len() {
        match decode_link_tuple(&body[offset..], has_etx) {
            Ok((tuple, consumed)) => {
                if let Some(tuple) = tuple {
                    links.push(tuple);
                }
                offset += consumed;
            }
            Err(err) => {
                log::warn!("invalid link tuple at offset {offset}: {err}");
                break;
            }
        }
    }

    Ok(message_from_header(
        header,
        MessageBody::Hello(HelloBody {
            htime,
            willingness,
            links,
            etx: has_etx,
        }),
    ))
}

pub(crate) fn decode_tc(
    header: &CommonHeader,
    body: &[u8],
    has_etx: bool,
) -> Result<Message, CodecError> {
    if body.len() < 4 {
        return Err(CodecError::InvalidMessage(format!(
            "runt TC, body is {} bytes",
            body.len()
        )));
    }
    let ansn = get_u16(body, 0);
    let record_len = LinkAddrInfo::wire_len(has_etx);
    let mut neighbors = Vec::new();
    let mut offset = 4;
    while body.len() - offset >= record_len {
        neighbors.push(LinkAddrInfo::decode(&body[offset..], has_etx));
        offset += record_len;
    }
    Ok(message_from_header(
        header,
        MessageBody::Tc(TcBody {
            ansn,
            neighbors,
            etx: has_etx,
        }),
    ))
}

pub(crate) fn decode_mid(header: &CommonHeader, body: &[u8]) -> Result<Message, CodecError> {
    let mut interfaces = Vec::new();
    let mut offset = 0;
    while body.len() - offset >= Ipv4Addr::ADDR_BYTELEN {
        interfaces.push(get_ipv4(body, offset));
        offset += Ipv4Addr::ADDR_BYTELEN;
    }
    if interfaces.is_empty() {
        return Err(CodecError::InvalidMessage("MID with no interfaces".to_string()));
    }
    Ok(message_from_header(header, MessageBody::Mid(MidBody { interfaces })))
}

pub(crate) fn decode_hna(header: &CommonHeader, body: &[u8]) -> Result<Message, CodecError> {
    let pair_len = 2 * Ipv4Addr::ADDR_BYTELEN;
    let mut networks = Vec::new();
    let mut offset = 0;
    while body.len() - offset >= pair_len {
        let addr = get_ipv4(body, offset);
        let mask = get_ipv4(body, offset + 4);
        offset += pair_len;
        match ipv4_mask_len(mask) {
            Some(prefix_len) => match Ipv4Net::new(addr, prefix_len) {
                Ok(net) => networks.push(net),
                Err(err) => log::warn!("HNA network {addr}/{mask} rejected: {err}"),
            },
            None => log::warn!("HNA network {addr} has non-contiguous mask {mask}"),
        }
    }
    if networks.is_empty() {
        return Err(CodecError::InvalidMessage("HNA with no networks".to_string()));
    }
    Ok(message_from_header(header, MessageBody::Hna(HnaBody { networks })))
}

pub(crate) fn decode_unknown(header: &CommonHeader, raw: &[u8]) -> Message {
    message_from_header(
        header,
        MessageBody::Unknown(UnknownBody {
            type_code: header.type_code,
            raw: raw[..header.size].to_vec(),
        }),
    )
}
