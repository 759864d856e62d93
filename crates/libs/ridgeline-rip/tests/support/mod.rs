//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use ridgeline_event::{Clock, ManualClock, TimeVal, TimerList};
use ridgeline_net::ServiceStatus;
use rip_core::constants::RIP_PORT;
use rip_core::packets::{PacketRouteEntry, RipCommand, RipPacket, RipPacketHeader, IPV4_VERSION};
use rip_core::PortIo;

/// One datagram captured from a spoof transport.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub data: Vec<u8>,
}

/// Loopback transport that records everything sent through it.
pub struct SpoofPortIo {
    ifname: String,
    vifname: String,
    addr: Ipv4Addr,
    socket_id: u32,
    status: ServiceStatus,
    pub sent: Rc<RefCell<Vec<SentPacket>>>,
}

impl SpoofPortIo {
    pub fn new(ifname: &str, vifname: &str, addr: Ipv4Addr, socket_id: u32) -> SpoofPortIo {
        SpoofPortIo {
            ifname: ifname.to_string(),
            vifname: vifname.to_string(),
            addr,
            socket_id,
            status: ServiceStatus::Running,
            sent: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn sent_handle(&self) -> Rc<RefCell<Vec<SentPacket>>> {
        Rc::clone(&self.sent)
    }
}

impl PortIo<Ipv4Addr> for SpoofPortIo {
    fn send(&mut self, dst: &Ipv4Addr, dst_port: u16, payload: &[u8]) -> bool {
        self.sent.borrow_mut().push(SentPacket {
            dst: *dst,
            dst_port,
            data: payload.to_vec(),
        });
        true
    }

    fn enabled(&self) -> bool {
        self.status == ServiceStatus::Running
    }

    fn ifname(&self) -> &str {
        &self.ifname
    }

    fn vifname(&self) -> &str {
        &self.vifname
    }

    fn address(&self) -> Ipv4Addr {
        self.addr
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn request_shutdown(&mut self) {
        self.status = ServiceStatus::ShuttingDown;
    }

    fn status(&self) -> ServiceStatus {
        self.status
    }
}

/// A manual clock plus a timer list driven by it.
pub fn manual_timers() -> (Rc<ManualClock>, TimerList) {
    let clock = Rc::new(ManualClock::new(TimeVal::ZERO));
    let timers = TimerList::new(clock.clone() as Rc<dyn Clock>);
    (clock, timers)
}

/// Step simulated time forward in one-second ticks, firing due timers.
pub fn run_for_secs(clock: &ManualClock, timers: &TimerList, secs: i64) {
    for _ in 0..secs {
        clock.step(TimeVal::from_secs(1));
        while timers.run_due() > 0 {}
    }
}

/// Encode a RIPv2 response carrying `routes` as `(net, nexthop, metric,
/// tag)` tuples.
pub fn build_response(routes: &[(&str, Ipv4Addr, u32, u16)]) -> Vec<u8> {
    let header = RipPacketHeader::new(RipCommand::Response, IPV4_VERSION);
    let mut packet = RipPacket::new(Ipv4Addr::UNSPECIFIED, RIP_PORT, header);
    for (net, nexthop, metric, tag) in routes {
        packet.append_entry(&PacketRouteEntry::new_route(
            *tag,
            net.parse().expect("prefix"),
            *nexthop,
            *metric,
        ));
    }
    packet.data().to_vec()
}

/// Encode a whole-table request.
pub fn build_table_request() -> Vec<u8> {
    let header = RipPacketHeader::new(RipCommand::Request, IPV4_VERSION);
    let mut packet = RipPacket::new(Ipv4Addr::UNSPECIFIED, RIP_PORT, header);
    packet.append_entry(&PacketRouteEntry::table_request());
    packet.data().to_vec()
}

/// Decode the route entries of an encoded response, skipping `skip`
/// head entries.
pub fn decode_entries(data: &[u8], skip: usize) -> Vec<PacketRouteEntry> {
    let mut entries = Vec::new();
    let mut offset = 4 + skip * 20;
    while offset + 20 <= data.len() {
        if let Some(entry) = PacketRouteEntry::decode(&data[offset..]) {
            entries.push(entry);
        }
        offset += 20;
    }
    entries
}
