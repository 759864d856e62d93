//! RIPv2 (RFC 2453) protocol engine.
//!
//! The wire codec and authentication handlers are IPv4-concrete; the
//! route database, update queue and origin tracking are generic over
//! [`ridgeline_net::RouteAddress`] so the containers are shared with
//! the RIPng work.

pub mod auth;
pub mod constants;
pub mod packet_queue;
pub mod packets;
pub mod peer;
pub mod policy;
pub mod port;
pub mod port_io;
pub mod port_manager;
pub mod route_db;
pub mod system;
pub mod update_queue;

pub use auth::{
    AuthError, AuthHandler, InboundEntries, KeyError, Md5AuthHandler, Md5Key, NullAuthHandler,
    PlaintextAuthHandler,
};
pub use packet_queue::PacketQueue;
pub use packets::{PacketError, PacketRouteEntry, RipCommand, RipPacket, RipPacketHeader};
pub use peer::{Peer, PeerCounters};
pub use policy::{PolicyFilters, PolicyTags};
pub use port::{Horizon, Port, PortCounters, PortTimerConstants};
pub use port_io::PortIo;
pub use port_manager::{PortIoFactory, PortManager, PortManagerError};
pub use route_db::{RouteDb, RouteEntry, RouteOrigin, RouteRef};
pub use system::RipSystem;
pub use update_queue::{ReadIterator, RouteEvent, UpdateKind, UpdateQueue};
