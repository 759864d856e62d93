//! Remote hosts that send us routes.

use std::cell::RefCell;
use std::rc::Rc;

use ridgeline_event::TimeVal;
use ridgeline_net::RouteAddress;

use crate::port::PortTimerConstants;
use crate::route_db::{RouteOrigin, RouteRef};

/// Packet/route counters kept per peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerCounters {
    packets_recv: u32,
    update_packets_recv: u32,
    table_requests_recv: u32,
    bad_routes: u32,
    bad_packets: u32,
    bad_auth_packets: u32,
}

impl PeerCounters {
    pub fn packets_recv(&self) -> u32 {
        self.packets_recv
    }

    pub fn incr_packets_recv(&mut self) {
        self.packets_recv += 1;
    }

    pub fn update_packets_recv(&self) -> u32 {
        self.update_packets_recv
    }

    pub fn incr_update_packets_recv(&mut self) {
        self.update_packets_recv += 1;
    }

    pub fn table_requests_recv(&self) -> u32 {
        self.table_requests_recv
    }

    pub fn incr_table_requests_recv(&mut self) {
        self.table_requests_recv += 1;
    }

    pub fn bad_routes(&self) -> u32 {
        self.bad_routes
    }

    pub fn incr_bad_routes(&mut self) {
        self.bad_routes += 1;
    }

    pub fn bad_packets(&self) -> u32 {
        self.bad_packets
    }

    pub fn incr_bad_packets(&mut self) {
        self.bad_packets += 1;
    }

    pub fn bad_auth_packets(&self) -> u32 {
        self.bad_auth_packets
    }

    pub fn incr_bad_auth_packets(&mut self) {
        self.bad_auth_packets += 1;
    }
}

/// A host that has sent RIP packets to one of our ports.
///
/// The peer owns the routes it originated through its [`RouteOrigin`];
/// while any of those routes remain in the database the peer record
/// stays alive.
pub struct Peer<A: RouteAddress> {
    addr: A,
    origin: RouteOrigin<A>,
    counters: PeerCounters,
    last_active: TimeVal,
}

impl<A: RouteAddress> Peer<A> {
    pub fn new(addr: A, port_id: u32, constants: Rc<RefCell<PortTimerConstants>>) -> Peer<A> {
        Peer {
            addr,
            origin: RouteOrigin::new_peer(port_id, addr, constants),
            counters: PeerCounters::default(),
            last_active: TimeVal::ZERO,
        }
    }

    pub fn address(&self) -> A {
        self.addr
    }

    pub fn origin(&self) -> &RouteOrigin<A> {
        &self.origin
    }

    pub fn counters(&self) -> &PeerCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut PeerCounters {
        &mut self.counters
    }

    pub fn last_active(&self) -> TimeVal {
        self.last_active
    }

    pub fn set_last_active(&mut self, when: TimeVal) {
        self.last_active = when;
    }

    pub fn route_count(&self) -> usize {
        self.origin.route_count()
    }

    pub fn dump_routes(&self) -> Vec<RouteRef<A>> {
        self.origin.dump_routes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn counters_accumulate() {
        let constants = Rc::new(RefCell::new(PortTimerConstants::default()));
        let mut peer = Peer::new(Ipv4Addr::new(10, 0, 0, 1), 1, constants);
        peer.counters_mut().incr_packets_recv();
        peer.counters_mut().incr_packets_recv();
        peer.counters_mut().incr_bad_auth_packets();
        assert_eq!(peer.counters().packets_recv(), 2);
        assert_eq!(peer.counters().bad_auth_packets(), 1);
        assert_eq!(peer.route_count(), 0);
    }
}
