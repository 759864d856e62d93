//! The seam between a port and its datagram transport.

use ridgeline_net::{RouteAddress, ServiceStatus};

/// Transport binding a port sends and receives through.
///
/// Implementations are synchronous and non-blocking; the inbound
/// direction arrives via `PortManager::deliver_packet`, keyed by
/// `socket_id`.
pub trait PortIo<A: RouteAddress> {
    /// Attempt to transmit one datagram. A false return means the
    /// packet was not accepted and the caller should back off.
    fn send(&mut self, dst: &A, dst_port: u16, payload: &[u8]) -> bool;

    /// True while an earlier send is still in flight.
    fn pending(&self) -> bool {
        false
    }

    /// Whether the underlying binding is usable.
    fn enabled(&self) -> bool;

    fn ifname(&self) -> &str;

    fn vifname(&self) -> &str;

    fn address(&self) -> A;

    /// Stable identity used to route inbound packets to this port.
    fn socket_id(&self) -> u32;

    /// Begin asynchronous teardown; the owner parks the port in a dead
    /// set until `status` reports `Shutdown`.
    fn request_shutdown(&mut self);

    fn status(&self) -> ServiceStatus;
}
