//! Protocol constants (RFC 2453 §4 and the usual BSD routed defaults).

use std::net::Ipv4Addr;

/// UDP port RIP speaks on.
pub const RIP_PORT: u16 = 520;

/// The unreachable metric.
pub const RIP_INFINITY: u32 = 16;

/// Route entries per packet without authentication.
pub const RIPV2_ROUTES_PER_PACKET: usize = 25;

/// RIPv2 multicast group for unsolicited responses.
pub const RIP_V2_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 9);

pub const DEFAULT_EXPIRY_SECS: u32 = 180;
pub const DEFAULT_DELETION_SECS: u32 = 120;
pub const DEFAULT_UNSOLICITED_RESPONSE_SECS: u32 = 30;
pub const DEFAULT_TRIGGERED_UPDATE_MIN_WAIT_SECS: u32 = 1;
pub const DEFAULT_TRIGGERED_UPDATE_MAX_WAIT_SECS: u32 = 5;
pub const DEFAULT_INTERPACKET_DELAY_MS: u32 = 50;
pub const DEFAULT_INTERQUERY_GAP_MS: u32 = 1000;
pub const DEFAULT_MAX_PACKET_BUFFER_BYTES: usize = 64 * 1024;
