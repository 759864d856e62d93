//! Address family abstraction and network prefixes.

use std::fmt;
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Behaviour the routing code needs from an IP address family.
///
/// Implemented for `Ipv4Addr` and `Ipv6Addr`; the generic containers
/// (route database, update queue) are parameterized over it.
pub trait RouteAddress:
    Copy + Clone + Eq + Ord + Hash + fmt::Debug + fmt::Display + 'static
{
    const ADDR_BITLEN: u8;
    const ADDR_BYTELEN: usize;

    fn ip_version(&self) -> u8;
    fn zero() -> Self;
    fn is_zero(&self) -> bool;
    fn is_multicast_addr(&self) -> bool;
    fn is_loopback_addr(&self) -> bool;

    fn to_wire(&self, buf: &mut Vec<u8>);
    fn from_wire(bytes: &[u8]) -> Option<Self>;

    /// Mask off all but the leading `prefix_len` bits.
    fn mask_by_prefix(&self, prefix_len: u8) -> Self;
}

impl RouteAddress for Ipv4Addr {
    const ADDR_BITLEN: u8 = 32;
    const ADDR_BYTELEN: usize = 4;

    fn ip_version(&self) -> u8 {
        4
    }

    fn zero() -> Self {
        Ipv4Addr::UNSPECIFIED
    }

    fn is_zero(&self) -> bool {
        self.is_unspecified()
    }

    fn is_multicast_addr(&self) -> bool {
        self.is_multicast()
    }

    fn is_loopback_addr(&self) -> bool {
        self.is_loopback()
    }

    fn to_wire(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.octets());
    }

    fn from_wire(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    fn mask_by_prefix(&self, prefix_len: u8) -> Self {
        Ipv4Addr::from(u32::from(*self) & ipv4_netmask_bits(prefix_len))
    }
}

impl RouteAddress for Ipv6Addr {
    const ADDR_BITLEN: u8 = 128;
    const ADDR_BYTELEN: usize = 16;

    fn ip_version(&self) -> u8 {
        6
    }

    fn zero() -> Self {
        Ipv6Addr::UNSPECIFIED
    }

    fn is_zero(&self) -> bool {
        self.is_unspecified()
    }

    fn is_multicast_addr(&self) -> bool {
        self.is_multicast()
    }

    fn is_loopback_addr(&self) -> bool {
        self.is_loopback()
    }

    fn to_wire(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.octets());
    }

    fn from_wire(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    }

    fn mask_by_prefix(&self, prefix_len: u8) -> Self {
        let bits = u128::from(*self);
        let mask = if prefix_len == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(prefix_len.min(128)))
        };
        Ipv6Addr::from(bits & mask)
    }
}

pub fn ipv4_netmask_bits(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    }
}

/// Netmask address for an IPv4 prefix length.
pub fn ipv4_netmask(prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(ipv4_netmask_bits(prefix_len))
}

/// Prefix length of a contiguous IPv4 netmask; `None` when the mask has
/// holes.
pub fn ipv4_mask_len(mask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(mask);
    let len = bits.leading_ones() as u8;
    if bits == ipv4_netmask_bits(len) {
        Some(len)
    } else {
        None
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PrefixError {
    #[error("prefix length {0} exceeds the address width")]
    PrefixTooLong(u8),

    #[error("malformed network prefix {0:?}")]
    Malformed(String),
}

/// A network prefix: masked address plus prefix length.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpNet<A: RouteAddress> {
    addr: A,
    prefix_len: u8,
}

pub type Ipv4Net = IpNet<Ipv4Addr>;
pub type Ipv6Net = IpNet<Ipv6Addr>;

impl<A: RouteAddress> IpNet<A> {
    /// Build a prefix; host bits of `addr` are masked off.
    pub fn new(addr: A, prefix_len: u8) -> Result<IpNet<A>, PrefixError> {
        if prefix_len > A::ADDR_BITLEN {
            return Err(PrefixError::PrefixTooLong(prefix_len));
        }
        Ok(IpNet {
            addr: addr.mask_by_prefix(prefix_len),
            prefix_len,
        })
    }

    pub fn masked_addr(&self) -> A {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_default(&self) -> bool {
        self.addr.is_zero() && self.prefix_len == 0
    }

    pub fn contains_addr(&self, addr: &A) -> bool {
        addr.mask_by_prefix(self.prefix_len) == self.addr
    }
}

impl Ipv4Net {
    pub fn netmask(&self) -> Ipv4Addr {
        ipv4_netmask(self.prefix_len)
    }
}

impl<A: RouteAddress> fmt::Display for IpNet<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl<A: RouteAddress> fmt::Debug for IpNet<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl<A: RouteAddress + FromStr> FromStr for IpNet<A> {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| PrefixError::Malformed(s.to_string()))?;
        let addr = addr
            .parse::<A>()
            .map_err(|_| PrefixError::Malformed(s.to_string()))?;
        let len = len
            .parse::<u8>()
            .map_err(|_| PrefixError::Malformed(s.to_string()))?;
        IpNet::new(addr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_prefix_masks_host_bits() {
        let net: Ipv4Net = "10.0.10.77/24".parse().expect("parse");
        assert_eq!(net.masked_addr(), Ipv4Addr::new(10, 0, 10, 0));
        assert_eq!(net.prefix_len(), 24);
        assert_eq!(net.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!(net.contains_addr(&Ipv4Addr::new(10, 0, 10, 200)));
        assert!(!net.contains_addr(&Ipv4Addr::new(10, 0, 11, 1)));
    }

    #[test]
    fn v4_mask_len_detects_holes() {
        assert_eq!(ipv4_mask_len(Ipv4Addr::new(255, 255, 255, 0)), Some(24));
        assert_eq!(ipv4_mask_len(Ipv4Addr::new(255, 255, 255, 255)), Some(32));
        assert_eq!(ipv4_mask_len(Ipv4Addr::new(0, 0, 0, 0)), Some(0));
        assert_eq!(ipv4_mask_len(Ipv4Addr::new(255, 0, 255, 0)), None);
    }

    #[test]
    fn default_route_detection() {
        let net = Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("prefix");
        assert!(net.is_default());
        let host = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 1), 32).expect("prefix");
        assert!(!host.is_default());
    }

    #[test]
    fn rejects_overlong_prefix() {
        assert_eq!(
            Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 33),
            Err(PrefixError::PrefixTooLong(33))
        );
    }

    #[test]
    fn v6_masking() {
        let net: Ipv6Net = "2001:db8::1/32".parse().expect("parse");
        assert_eq!(net.masked_addr(), "2001:db8::".parse::<Ipv6Addr>().expect("addr"));
    }

    #[test]
    fn wire_roundtrip() {
        let addr = Ipv4Addr::new(192, 168, 122, 22);
        let mut buf = Vec::new();
        addr.to_wire(&mut buf);
        assert_eq!(buf, vec![192, 168, 122, 22]);
        assert_eq!(Ipv4Addr::from_wire(&buf), Some(addr));
        assert_eq!(Ipv4Addr::from_wire(&buf[..3]), None);
    }
}
