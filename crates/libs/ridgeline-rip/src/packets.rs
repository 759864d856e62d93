//! RIPv2 wire format (RFC 2453 §4).
//!
//! All multi-byte fields are network byte order. The header is 4 bytes;
//! every entry, route or authentication, is exactly 20.

use std::net::Ipv4Addr;

use ridgeline_net::{ipv4_mask_len, ipv4_netmask, Ipv4Net, RouteAddress};

use crate::constants::{RIPV2_ROUTES_PER_PACKET, RIP_INFINITY};

pub const HEADER_BYTES: usize = 4;
pub const ENTRY_BYTES: usize = 20;

/// Smallest well-formed packet: a bare header.
pub const MIN_PACKET_BYTES: usize = HEADER_BYTES;

/// Smallest authenticated packet: header plus the auth entry.
pub const MIN_AUTH_PACKET_BYTES: usize = HEADER_BYTES + ENTRY_BYTES;

/// Largest packet without an authentication trailer.
pub const MAX_PACKET_BYTES: usize = HEADER_BYTES + RIPV2_ROUTES_PER_PACKET * ENTRY_BYTES;

/// Version expected in packets exchanged on an IPv4 RIPv2 port.
pub const IPV4_VERSION: u8 = 2;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too small ({0} bytes)")]
    PacketTooSmall(usize),

    #[error("packet too large ({0} bytes)")]
    PacketTooLarge(usize),

    #[error("invalid command {0}")]
    InvalidCommand(u8),

    #[error("invalid version {0}")]
    InvalidVersion(u8),

    #[error("invalid padding ({0:#04x}, {1:#04x})")]
    InvalidPadding(u8, u8),

    #[error("non-integral route entries ({0} bytes)")]
    NonIntegralEntries(usize),

    #[error("unexpected authentication entry (type {0})")]
    UnexpectedAuthEntry(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RipCommand {
    Request = 1,
    Response = 2,
}

impl RipCommand {
    pub fn from_byte(b: u8) -> Result<RipCommand, PacketError> {
        match b {
            1 => Ok(RipCommand::Request),
            2 => Ok(RipCommand::Response),
            other => Err(PacketError::InvalidCommand(other)),
        }
    }
}

/// The 4-byte header at the start of every RIP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipPacketHeader {
    pub command: RipCommand,
    pub version: u8,
}

impl RipPacketHeader {
    pub fn new(command: RipCommand, version: u8) -> RipPacketHeader {
        RipPacketHeader { command, version }
    }

    /// Validate size, command and must-be-zero padding. Version
    /// expectations are per address family and checked by the caller
    /// with [`RipPacketHeader::valid_version`].
    pub fn decode(buf: &[u8]) -> Result<RipPacketHeader, PacketError> {
        if buf.len() < HEADER_BYTES {
            return Err(PacketError::PacketTooSmall(buf.len()));
        }
        let command = RipCommand::from_byte(buf[0])?;
        let version = buf[1];
        if buf[2] != 0 || buf[3] != 0 {
            return Err(PacketError::InvalidPadding(buf[2], buf[3]));
        }
        Ok(RipPacketHeader { command, version })
    }

    pub fn valid_version(&self, expected: u8) -> bool {
        self.version == expected
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.command as u8);
        buf.push(self.version);
        buf.push(0);
        buf.push(0);
    }
}

/// Address family marking an entry as a route (RFC 2453 uses the BSD
/// AF_INET value).
pub const ADDR_FAMILY_INET: u16 = 2;
/// Address family of the whole-table request marker.
pub const ADDR_FAMILY_DUMP: u16 = 0;
/// Address family marking an in-band authentication entry.
pub const ADDR_FAMILY_AUTH: u16 = 0xffff;

/// One 20-byte route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRouteEntry {
    pub addr_family: u16,
    pub tag: u16,
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub nexthop: Ipv4Addr,
    pub metric: u32,
}

impl PacketRouteEntry {
    pub fn new_route(tag: u16, net: Ipv4Net, nexthop: Ipv4Addr, metric: u32) -> PacketRouteEntry {
        PacketRouteEntry {
            addr_family: ADDR_FAMILY_INET,
            tag,
            addr: net.masked_addr(),
            mask: ipv4_netmask(net.prefix_len()),
            nexthop,
            metric,
        }
    }

    /// The dump-all marker: family 0, metric 16.
    pub fn table_request() -> PacketRouteEntry {
        PacketRouteEntry {
            addr_family: ADDR_FAMILY_DUMP,
            tag: 0,
            addr: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            nexthop: Ipv4Addr::UNSPECIFIED,
            metric: RIP_INFINITY,
        }
    }

    pub fn is_auth_entry(&self) -> bool {
        self.addr_family == ADDR_FAMILY_AUTH
    }

    pub fn is_table_request(&self) -> bool {
        self.addr_family == ADDR_FAMILY_DUMP && self.metric == RIP_INFINITY
    }

    /// The advertised prefix; `None` when the mask is non-contiguous.
    pub fn net(&self) -> Option<Ipv4Net> {
        let prefix_len = ipv4_mask_len(self.mask)?;
        Ipv4Net::new(self.addr, prefix_len).ok()
    }

    pub fn decode(buf: &[u8]) -> Option<PacketRouteEntry> {
        if buf.len() < ENTRY_BYTES {
            return None;
        }
        Some(PacketRouteEntry {
            addr_family: u16::from_be_bytes([buf[0], buf[1]]),
            tag: u16::from_be_bytes([buf[2], buf[3]]),
            addr: Ipv4Addr::from_wire(&buf[4..8])?,
            mask: Ipv4Addr::from_wire(&buf[8..12])?,
            nexthop: Ipv4Addr::from_wire(&buf[12..16])?,
            metric: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.addr_family.to_be_bytes());
        buf.extend_from_slice(&self.tag.to_be_bytes());
        self.addr.to_wire(buf);
        self.mask.to_wire(buf);
        self.nexthop.to_wire(buf);
        buf.extend_from_slice(&self.metric.to_be_bytes());
    }
}

/// An outbound RIP packet: destination plus raw bytes.
///
/// The data buffer always starts with a [`RipPacketHeader`]; entries
/// are appended behind it. Authentication handlers may overwrite the
/// first (head) entry and append trailer bytes.
#[derive(Debug, Clone)]
pub struct RipPacket<A: RouteAddress> {
    addr: A,
    port: u16,
    data: Vec<u8>,
}

impl<A: RouteAddress> RipPacket<A> {
    pub fn new(addr: A, port: u16, header: RipPacketHeader) -> RipPacket<A> {
        let mut data = Vec::with_capacity(MAX_PACKET_BYTES);
        header.encode(&mut data);
        RipPacket { addr, port, data }
    }

    pub fn address(&self) -> &A {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_bytes(&self) -> usize {
        self.data.len()
    }

    /// Append a zeroed entry, reserving space for an authentication
    /// head entry.
    pub fn append_blank_entry(&mut self) {
        self.data.extend_from_slice(&[0u8; ENTRY_BYTES]);
    }

    pub fn append_entry(&mut self, entry: &PacketRouteEntry) {
        entry.encode(&mut self.data);
    }

    pub fn append_data(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Number of whole 20-byte entries behind the header.
    pub fn entry_count(&self) -> usize {
        self.data.len().saturating_sub(HEADER_BYTES) / ENTRY_BYTES
    }

    /// Mutable access to entry `i`'s 20 bytes.
    pub fn entry_bytes_mut(&mut self, i: usize) -> Option<&mut [u8]> {
        let start = HEADER_BYTES + i * ENTRY_BYTES;
        let end = start + ENTRY_BYTES;
        if end > self.data.len() {
            return None;
        }
        Some(&mut self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_are_wire_exact() {
        assert_eq!(HEADER_BYTES, MIN_PACKET_BYTES);
        assert_eq!(HEADER_BYTES + ENTRY_BYTES, MIN_AUTH_PACKET_BYTES);
        assert_eq!(MAX_PACKET_BYTES, 504);
    }

    #[test]
    fn header_roundtrip() {
        let header = RipPacketHeader::new(RipCommand::Response, IPV4_VERSION);
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf, [2, 2, 0, 0]);
        assert_eq!(RipPacketHeader::decode(&buf), Ok(header));
    }

    #[test]
    fn header_rejects_bad_fields() {
        assert_eq!(
            RipPacketHeader::decode(&[3, 2, 0, 0]),
            Err(PacketError::InvalidCommand(3))
        );
        assert_eq!(
            RipPacketHeader::decode(&[1, 2, 1, 0]),
            Err(PacketError::InvalidPadding(1, 0))
        );
        assert_eq!(
            RipPacketHeader::decode(&[1, 2]),
            Err(PacketError::PacketTooSmall(2))
        );
    }

    #[test]
    fn entry_roundtrip() {
        let net: Ipv4Net = "10.0.10.0/24".parse().expect("prefix");
        let entry = PacketRouteEntry::new_route(1096, net, Ipv4Addr::new(10, 0, 10, 1), 12);
        let mut buf = Vec::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), ENTRY_BYTES);
        let decoded = PacketRouteEntry::decode(&buf).expect("decode");
        assert_eq!(decoded, entry);
        assert_eq!(decoded.net(), Some(net));
        assert!(!decoded.is_auth_entry());
        assert!(!decoded.is_table_request());
    }

    #[test]
    fn table_request_marker() {
        let marker = PacketRouteEntry::table_request();
        assert!(marker.is_table_request());
        let mut buf = Vec::new();
        marker.encode(&mut buf);
        let decoded = PacketRouteEntry::decode(&buf).expect("decode");
        assert!(decoded.is_table_request());
    }

    #[test]
    fn noncontiguous_mask_has_no_net() {
        let mut entry = PacketRouteEntry::new_route(
            0,
            "10.0.0.0/8".parse().expect("prefix"),
            Ipv4Addr::UNSPECIFIED,
            1,
        );
        entry.mask = Ipv4Addr::new(255, 0, 255, 0);
        assert_eq!(entry.net(), None);
    }

    #[test]
    fn packet_entry_accounting() {
        let header = RipPacketHeader::new(RipCommand::Response, IPV4_VERSION);
        let mut packet = RipPacket::new(Ipv4Addr::new(10, 0, 0, 2), 520, header);
        packet.append_blank_entry();
        packet.append_entry(&PacketRouteEntry::new_route(
            0,
            "192.168.0.0/16".parse().expect("prefix"),
            Ipv4Addr::UNSPECIFIED,
            2,
        ));
        assert_eq!(packet.entry_count(), 2);
        assert_eq!(packet.data_bytes(), HEADER_BYTES + 2 * ENTRY_BYTES);
        assert!(packet.entry_bytes_mut(1).is_some());
        assert!(packet.entry_bytes_mut(2).is_none());
    }
}
