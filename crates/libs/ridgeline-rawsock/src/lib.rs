//! Raw-socket multiplexing service.
//!
//! At most one kernel socket exists per `(address family, IP protocol)`
//! pair; it is opened when the first receiver filter is registered and
//! closed when the last one goes. Inbound packets are fanned out to
//! receivers through their filters; multicast group membership is
//! reference-counted per `(interface, vif, group)` so the kernel sees
//! exactly one join no matter how many receivers want the group.

pub mod manager;
pub mod transport;

pub use manager::{Family, InputFilter, ManagerError, RawSocketManager};
pub use transport::{
    DummyTransport, RawSocketTransport, RecvMeta, SendSpec, SystemTransport, TransportError,
    TransportOp,
};
