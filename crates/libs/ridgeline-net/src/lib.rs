//! Data-model primitives shared by the protocol engines: an address
//! abstraction over `Ipv4Addr`/`Ipv6Addr`, network prefixes, and the
//! pushed interface/vif/address tree the port managers subscribe to.

pub mod addr;
pub mod iftree;
pub mod service;

pub use addr::{ipv4_mask_len, ipv4_netmask, IpNet, Ipv4Net, Ipv6Net, PrefixError, RouteAddress};
pub use iftree::{IfTree, IfTreeAddr, IfTreeInterface, IfTreeVif, IfTreeObserver};
pub use service::ServiceStatus;
