//! A RIP port: one local interface/address speaking the protocol.
//!
//! The port owns its peers, its outbound packet queue, the unsolicited
//! and triggered update timers, and the authentication handler. Inbound
//! packets arrive through the port manager; outbound packets drain to
//! the attached [`PortIo`] binding under an interpacket pacing timer.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};

use rand_core::{OsRng, RngCore};

use ridgeline_event::{TimeVal, Timer, TimerList};
use ridgeline_net::{Ipv4Net, RouteAddress};

use crate::auth::AuthHandler;
use crate::constants::{
    DEFAULT_DELETION_SECS, DEFAULT_EXPIRY_SECS, DEFAULT_INTERPACKET_DELAY_MS,
    DEFAULT_INTERQUERY_GAP_MS, DEFAULT_TRIGGERED_UPDATE_MAX_WAIT_SECS,
    DEFAULT_TRIGGERED_UPDATE_MIN_WAIT_SECS, DEFAULT_UNSOLICITED_RESPONSE_SECS, RIP_INFINITY,
    RIP_PORT, RIP_V2_GROUP,
};
use crate::packet_queue::PacketQueue;
use crate::packets::{
    PacketRouteEntry, RipCommand, RipPacket, RipPacketHeader, ADDR_FAMILY_INET, ENTRY_BYTES,
    IPV4_VERSION, MIN_PACKET_BYTES,
};
use crate::peer::Peer;
use crate::policy::PolicyTags;
use crate::port_io::PortIo;
use crate::route_db::RouteDb;
use crate::update_queue::{ReadIterator, RouteEvent, UpdateKind, UpdateQueue};

/// What a port advertises back on the interface it learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Horizon {
    /// Advertise everything.
    None,
    /// Omit routes whose origin resides on this port.
    SplitHorizon,
    /// Advertise such routes with metric 16.
    #[default]
    PoisonReverse,
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Horizon::None => "none",
            Horizon::SplitHorizon => "split-horizon",
            Horizon::PoisonReverse => "split-horizon-poison-reverse",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Horizon {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Horizon::None),
            "split-horizon" => Ok(Horizon::SplitHorizon),
            "split-horizon-poison-reverse" | "poison-reverse" => Ok(Horizon::PoisonReverse),
            other => Err(format!("unknown horizon {other:?}")),
        }
    }
}

/// Timer constants governing routes received on a port.
#[derive(Debug, Clone, Copy)]
pub struct PortTimerConstants {
    expiry_secs: u32,
    deletion_secs: u32,
    triggered_update_min_wait_secs: u32,
    triggered_update_max_wait_secs: u32,
    unsolicited_response_secs: u32,
    interpacket_delay_ms: u32,
    interquery_delay_ms: u32,
}

impl Default for PortTimerConstants {
    fn default() -> Self {
        PortTimerConstants {
            expiry_secs: DEFAULT_EXPIRY_SECS,
            deletion_secs: DEFAULT_DELETION_SECS,
            triggered_update_min_wait_secs: DEFAULT_TRIGGERED_UPDATE_MIN_WAIT_SECS,
            triggered_update_max_wait_secs: DEFAULT_TRIGGERED_UPDATE_MAX_WAIT_SECS,
            unsolicited_response_secs: DEFAULT_UNSOLICITED_RESPONSE_SECS,
            interpacket_delay_ms: DEFAULT_INTERPACKET_DELAY_MS,
            interquery_delay_ms: DEFAULT_INTERQUERY_GAP_MS,
        }
    }
}

impl PortTimerConstants {
    pub fn expiry_secs(&self) -> u32 {
        self.expiry_secs
    }

    pub fn set_expiry_secs(&mut self, t: u32) {
        self.expiry_secs = t;
    }

    pub fn deletion_secs(&self) -> u32 {
        self.deletion_secs
    }

    pub fn set_deletion_secs(&mut self, t: u32) {
        self.deletion_secs = t;
    }

    pub fn triggered_update_min_wait_secs(&self) -> u32 {
        self.triggered_update_min_wait_secs
    }

    pub fn set_triggered_update_min_wait_secs(&mut self, t: u32) {
        self.triggered_update_min_wait_secs = t;
    }

    pub fn triggered_update_max_wait_secs(&self) -> u32 {
        self.triggered_update_max_wait_secs
    }

    pub fn set_triggered_update_max_wait_secs(&mut self, t: u32) {
        self.triggered_update_max_wait_secs = t;
    }

    pub fn unsolicited_response_secs(&self) -> u32 {
        self.unsolicited_response_secs
    }

    pub fn set_unsolicited_response_secs(&mut self, t: u32) {
        self.unsolicited_response_secs = t;
    }

    pub fn interpacket_delay_ms(&self) -> u32 {
        self.interpacket_delay_ms
    }

    pub fn set_interpacket_delay_ms(&mut self, t: u32) {
        self.interpacket_delay_ms = t;
    }

    pub fn interquery_delay_ms(&self) -> u32 {
        self.interquery_delay_ms
    }

    pub fn set_interquery_delay_ms(&mut self, t: u32) {
        self.interquery_delay_ms = t;
    }
}

/// Packet counters kept per port.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortCounters {
    packets_recv: u32,
    bad_packets: u32,
    bad_routes: u32,
    triggered_updates: u32,
}

impl PortCounters {
    pub fn packets_recv(&self) -> u32 {
        self.packets_recv
    }

    pub fn bad_packets(&self) -> u32 {
        self.bad_packets
    }

    pub fn bad_routes(&self) -> u32 {
        self.bad_routes
    }

    pub fn triggered_updates(&self) -> u32 {
        self.triggered_updates
    }
}

#[derive(Default)]
struct TriggeredUpdateState {
    timer: Option<Timer>,
}

/// Draw a uniform value in `[lo, hi]` milliseconds.
fn uniform_ms(lo: u64, hi: u64) -> u64 {
    if hi <= lo {
        return lo;
    }
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    lo + u64::from_le_bytes(bytes) % (hi - lo + 1)
}

pub struct Port {
    id: u32,
    io: Box<dyn PortIo<Ipv4Addr>>,
    timers: TimerList,
    route_db: RouteDb<Ipv4Addr>,
    update_queue: UpdateQueue<Ipv4Addr>,
    uq_reader: ReadIterator,
    uq_observer: Option<u32>,
    constants: Rc<RefCell<PortTimerConstants>>,
    counters: PortCounters,
    peers: Vec<Rc<RefCell<Peer<Ipv4Addr>>>>,
    auth: AuthHandler,
    horizon: Horizon,
    cost: u32,
    enabled: bool,
    advertise: bool,
    advertise_default_route: bool,
    accept_default_route: bool,
    packet_queue: PacketQueue<Ipv4Addr>,
    us_timer: Option<Timer>,
    tu_state: Rc<RefCell<TriggeredUpdateState>>,
    query_block_timer: Option<Timer>,
    tx_timer: Option<Timer>,
    weak_self: Weak<RefCell<Port>>,
}

impl Port {
    /// Build a port over `io` and arm its update machinery.
    pub fn new(
        id: u32,
        io: Box<dyn PortIo<Ipv4Addr>>,
        timers: TimerList,
        route_db: RouteDb<Ipv4Addr>,
    ) -> Rc<RefCell<Port>> {
        let update_queue = route_db.update_queue();
        let uq_reader = update_queue.create_reader();
        let port = Rc::new_cyclic(|weak| {
            RefCell::new(Port {
                id,
                io,
                timers: timers.clone(),
                route_db,
                update_queue: update_queue.clone(),
                uq_reader,
                uq_observer: None,
                constants: Rc::new(RefCell::new(PortTimerConstants::default())),
                counters: PortCounters::default(),
                peers: Vec::new(),
                auth: AuthHandler::none(),
                horizon: Horizon::default(),
                cost: 1,
                enabled: false,
                advertise: false,
                advertise_default_route: false,
                accept_default_route: false,
                packet_queue: PacketQueue::new(),
                us_timer: None,
                tu_state: Rc::new(RefCell::new(TriggeredUpdateState::default())),
                query_block_timer: None,
                tx_timer: None,
                weak_self: weak.clone(),
            })
        });

        // arm the triggered-update observer: it touches only the shared
        // trigger state and the timer list, never the port itself, so
        // it is safe to run while the port is borrowed
        let observer_id = {
            let p = port.borrow();
            let tu_state = Rc::clone(&p.tu_state);
            let constants = Rc::clone(&p.constants);
            let observer_timers = timers.clone();
            let weak = p.weak_self.clone();
            update_queue.subscribe(move || {
                let mut state = tu_state.borrow_mut();
                if state
                    .timer
                    .as_ref()
                    .map(|t| t.scheduled())
                    .unwrap_or(false)
                {
                    return;
                }
                let (lo, hi) = {
                    let c = constants.borrow();
                    (
                        u64::from(c.triggered_update_min_wait_secs()) * 1000,
                        u64::from(c.triggered_update_max_wait_secs()) * 1000,
                    )
                };
                let delay = uniform_ms(lo, hi);
                let weak = weak.clone();
                state.timer = Some(observer_timers.new_oneoff_after(
                    TimeVal::from_ms(delay as i64),
                    move || {
                        if let Some(port) = weak.upgrade() {
                            port.borrow_mut().triggered_update();
                        }
                    },
                ));
            })
        };
        port.borrow_mut().uq_observer = Some(observer_id);
        port.borrow_mut().schedule_unsolicited();
        port
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn constants(&self) -> Rc<RefCell<PortTimerConstants>> {
        Rc::clone(&self.constants)
    }

    pub fn counters(&self) -> &PortCounters {
        &self.counters
    }

    pub fn io(&self) -> &dyn PortIo<Ipv4Addr> {
        self.io.as_ref()
    }

    pub fn io_mut(&mut self) -> &mut dyn PortIo<Ipv4Addr> {
        self.io.as_mut()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, en: bool) {
        self.enabled = en;
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn set_cost(&mut self, cost: u32) {
        self.cost = cost;
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    pub fn set_horizon(&mut self, horizon: Horizon) {
        self.horizon = horizon;
    }

    pub fn advertise(&self) -> bool {
        self.advertise
    }

    pub fn set_advertise(&mut self, en: bool) {
        self.advertise = en;
    }

    pub fn set_advertise_default_route(&mut self, en: bool) {
        self.advertise_default_route = en;
    }

    pub fn accept_default_route(&self) -> bool {
        self.accept_default_route
    }

    pub fn set_accept_default_route(&mut self, en: bool) {
        self.accept_default_route = en;
    }

    pub fn auth(&self) -> &AuthHandler {
        &self.auth
    }

    pub fn auth_mut(&mut self) -> &mut AuthHandler {
        &mut self.auth
    }

    pub fn set_auth(&mut self, auth: AuthHandler) {
        self.auth = auth;
    }

    pub fn peers(&self) -> &[Rc<RefCell<Peer<Ipv4Addr>>>] {
        &self.peers
    }

    pub fn peer(&self, addr: Ipv4Addr) -> Option<Rc<RefCell<Peer<Ipv4Addr>>>> {
        self.peers
            .iter()
            .find(|p| p.borrow().address() == addr)
            .cloned()
    }

    pub fn packet_queue(&self) -> &PacketQueue<Ipv4Addr> {
        &self.packet_queue
    }

    pub fn route_db(&self) -> RouteDb<Ipv4Addr> {
        self.route_db.clone()
    }

    /// Withdraw everything learned through this port and quiesce its
    /// timers; the I/O binding's teardown is the manager's business.
    pub fn shutdown(&mut self) {
        for peer in &self.peers {
            self.route_db.delete_routes_of(peer.borrow().origin());
        }
        self.peers.clear();
        self.us_timer = None;
        self.tx_timer = None;
        self.query_block_timer = None;
        self.tu_state.borrow_mut().timer = None;
        if let Some(id) = self.uq_observer.take() {
            self.update_queue.unsubscribe(id);
        }
        self.packet_queue.flush_packets();
        self.enabled = false;
    }

    // -----------------------------------------------------------------
    // Receive path

    /// Entry point for packets delivered by the port manager.
    pub fn port_io_receive(&mut self, src: Ipv4Addr, src_port: u16, packet: &[u8]) {
        let now = self.timers.current_time();
        let (peer, new_peer) = self.find_or_create_peer(src);
        {
            let mut p = peer.borrow_mut();
            p.counters_mut().incr_packets_recv();
            p.set_last_active(now);
        }
        self.counters.packets_recv += 1;

        if packet.len() < MIN_PACKET_BYTES {
            self.record_bad_packet(
                &format!(
                    "packet size less than minimum ({} < {MIN_PACKET_BYTES})",
                    packet.len()
                ),
                src,
                src_port,
                &peer,
            );
            return;
        }

        let header = match RipPacketHeader::decode(packet) {
            Ok(header) => header,
            Err(err) => {
                self.record_bad_packet(&err.to_string(), src, src_port, &peer);
                return;
            }
        };
        if !header.valid_version(IPV4_VERSION) {
            let err = crate::packets::PacketError::InvalidVersion(header.version);
            self.record_bad_packet(&err.to_string(), src, src_port, &peer);
            return;
        }

        // route injection from a non-canonical source port
        if header.command == RipCommand::Response && src_port != RIP_PORT {
            self.record_bad_packet(
                &format!("response originating on wrong port ({src_port} != {RIP_PORT})"),
                src,
                src_port,
                &peer,
            );
            return;
        }

        let entries = match self.auth.authenticate_inbound(packet, src, new_peer) {
            Ok(entries) => entries,
            Err(err) => {
                let cause = format!(
                    "packet failed authentication ({}): {err}",
                    self.auth.effective_name()
                );
                peer.borrow_mut().counters_mut().incr_bad_auth_packets();
                self.record_bad_packet(&cause, src, src_port, &peer);
                return;
            }
        };
        if entries.n_entries == 0 {
            return;
        }

        let mut parsed = Vec::with_capacity(entries.n_entries);
        for i in 0..entries.n_entries {
            let start = entries.offset + i * ENTRY_BYTES;
            if let Some(entry) = PacketRouteEntry::decode(&packet[start..]) {
                parsed.push(entry);
            }
        }

        match header.command {
            RipCommand::Response => {
                peer.borrow_mut().counters_mut().incr_update_packets_recv();
                self.parse_response(src, src_port, &parsed, &peer);
            }
            RipCommand::Request => {
                self.parse_request(src, src_port, &parsed, &peer);
            }
        }
    }

    fn parse_response(
        &mut self,
        src: Ipv4Addr,
        src_port: u16,
        entries: &[PacketRouteEntry],
        peer: &Rc<RefCell<Peer<Ipv4Addr>>>,
    ) {
        let ifname = self.io.ifname().to_string();
        let vifname = self.io.vifname().to_string();
        let origin = peer.borrow().origin().clone();

        for entry in entries {
            if entry.addr_family != ADDR_FAMILY_INET {
                self.record_bad_route("bad address family", src, src_port, peer);
                continue;
            }
            if entry.metric > RIP_INFINITY {
                self.record_bad_route("bad metric", src, src_port, peer);
                continue;
            }
            let net = match entry.net() {
                Some(net) => net,
                None => {
                    self.record_bad_route("bad netmask", src, src_port, peer);
                    continue;
                }
            };
            let masked = net.masked_addr();
            if masked.is_multicast_addr() {
                self.record_bad_route("multicast route", src, src_port, peer);
                continue;
            }
            if masked.octets()[0] == 127 {
                self.record_bad_route("loopback route", src, src_port, peer);
                continue;
            }
            if masked.octets()[0] >= 240 {
                self.record_bad_route("experimental route", src, src_port, peer);
                continue;
            }
            if masked.is_zero() {
                if net.prefix_len() != 0 {
                    self.record_bad_route("net 0", src, src_port, peer);
                    continue;
                }
                if !self.accept_default_route {
                    self.record_bad_route("default route", src, src_port, peer);
                    continue;
                }
            }

            let nexthop = if entry.nexthop.is_zero() {
                src
            } else {
                entry.nexthop
            };
            let metric = (entry.metric + self.cost).min(RIP_INFINITY);

            self.route_db.update_route(
                net,
                nexthop,
                &ifname,
                &vifname,
                metric,
                u32::from(entry.tag),
                &origin,
                PolicyTags::new(),
                false,
            );
        }
    }

    fn parse_request(
        &mut self,
        src: Ipv4Addr,
        src_port: u16,
        entries: &[PacketRouteEntry],
        peer: &Rc<RefCell<Peer<Ipv4Addr>>>,
    ) {
        if !self.io.enabled() {
            log::info!("discarding request: port I/O disabled");
            return;
        }

        if entries.len() == 1 && entries[0].is_table_request() {
            peer.borrow_mut().counters_mut().incr_table_requests_recv();
            if self.queries_blocked() {
                return;
            }
            self.send_table_response(src, src_port);
            self.block_queries();
            return;
        }

        if self.queries_blocked() {
            return;
        }

        // answer a specific-net query: known nets with their current
        // state, unknown nets as unreachable
        let mut out = Vec::new();
        for entry in entries.iter().take(self.auth.max_routing_entries()) {
            let net = match entry.net() {
                Some(net) => net,
                None => continue,
            };
            match self.route_db.find_route(&net) {
                Some(route) => {
                    let route = route.borrow();
                    out.push((
                        route.tag() as u16,
                        route.net(),
                        route.nexthop(),
                        route.cost(),
                    ));
                }
                None => out.push((0, net, Ipv4Addr::UNSPECIFIED, RIP_INFINITY)),
            }
        }
        self.enqueue_response(src, src_port, out);
        self.block_queries();
    }

    fn find_or_create_peer(&mut self, addr: Ipv4Addr) -> (Rc<RefCell<Peer<Ipv4Addr>>>, bool) {
        if let Some(peer) = self.peer(addr) {
            return (peer, false);
        }
        log::info!(
            "RIP port {}/{}/{} new peer {addr}",
            self.io.ifname(),
            self.io.vifname(),
            self.io.address()
        );
        let peer = Rc::new(RefCell::new(Peer::new(
            addr,
            self.id,
            Rc::clone(&self.constants),
        )));
        self.peers.push(Rc::clone(&peer));
        (peer, true)
    }

    fn record_bad_packet(
        &mut self,
        why: &str,
        src: Ipv4Addr,
        src_port: u16,
        peer: &Rc<RefCell<Peer<Ipv4Addr>>>,
    ) {
        log::info!(
            "RIP port {}/{}/{} received bad packet from {src}:{src_port} - {why}",
            self.io.ifname(),
            self.io.vifname(),
            self.io.address()
        );
        self.counters.bad_packets += 1;
        peer.borrow_mut().counters_mut().incr_bad_packets();
    }

    fn record_bad_route(
        &mut self,
        why: &str,
        src: Ipv4Addr,
        src_port: u16,
        peer: &Rc<RefCell<Peer<Ipv4Addr>>>,
    ) {
        log::info!(
            "RIP port {}/{}/{} received bad route from {src}:{src_port} - {why}",
            self.io.ifname(),
            self.io.vifname(),
            self.io.address()
        );
        self.counters.bad_routes += 1;
        peer.borrow_mut().counters_mut().incr_bad_routes();
    }

    // -----------------------------------------------------------------
    // Send path

    fn queries_blocked(&self) -> bool {
        self.query_block_timer
            .as_ref()
            .map(|t| t.scheduled())
            .unwrap_or(false)
    }

    fn block_queries(&mut self) {
        let gap = i64::from(self.constants.borrow().interquery_delay_ms());
        self.query_block_timer = Some(self.timers.new_oneoff_after(TimeVal::from_ms(gap), || {}));
    }

    /// Metric to advertise for a route given its origin, or `None` to
    /// suppress it entirely.
    fn horizon_cost(&self, origin_port: Option<u32>, cost: u32) -> Option<u32> {
        let learned_here = origin_port == Some(self.id);
        match self.horizon {
            Horizon::None => Some(cost),
            Horizon::SplitHorizon => {
                if learned_here {
                    None
                } else {
                    Some(cost)
                }
            }
            Horizon::PoisonReverse => {
                if learned_here {
                    Some(RIP_INFINITY)
                } else {
                    Some(cost)
                }
            }
        }
    }

    /// Queue a full-table response toward `dst`.
    pub fn send_table_response(&mut self, dst: Ipv4Addr, dst_port: u16) {
        let mut out = Vec::new();
        for route in self.route_db.dump_routes() {
            let route = route.borrow();
            let cost = match self.horizon_cost(route.origin().port_id(), route.cost()) {
                Some(cost) => cost,
                None => continue,
            };
            if route.net().is_default() && !self.advertise_default_route {
                continue;
            }
            out.push((route.tag() as u16, route.net(), route.nexthop(), cost));
        }
        self.enqueue_response(dst, dst_port, out);
    }

    fn enqueue_response(
        &mut self,
        dst: Ipv4Addr,
        dst_port: u16,
        entries: Vec<(u16, Ipv4Net, Ipv4Addr, u32)>,
    ) {
        let max_entries = self.auth.max_routing_entries();
        for chunk in entries.chunks(max_entries.max(1)) {
            let header = RipPacketHeader::new(RipCommand::Response, IPV4_VERSION);
            let mut packet = RipPacket::new(dst, dst_port, header);
            for _ in 0..self.auth.head_entries() {
                packet.append_blank_entry();
            }
            for (tag, net, nexthop, cost) in chunk {
                packet.append_entry(&PacketRouteEntry::new_route(*tag, *net, *nexthop, *cost));
            }
            match self.auth.authenticate_outbound(&packet) {
                Ok((auth_packets, _)) => {
                    for auth_packet in auth_packets {
                        self.packet_queue.enqueue_packet(auth_packet);
                    }
                }
                Err(err) => log::warn!("outbound authentication failed: {err}"),
            }
        }
        self.push_packets();
    }

    /// Drain the outbound queue: one send per interpacket gap.
    pub fn push_packets(&mut self) {
        if self
            .tx_timer
            .as_ref()
            .map(|t| t.scheduled())
            .unwrap_or(false)
        {
            return;
        }
        if self.io.pending() {
            return;
        }
        let (dst, dst_port, data) = match self.packet_queue.head() {
            Some(head) => (*head.address(), head.port(), head.data().to_vec()),
            None => return,
        };
        if self.io.send(&dst, dst_port, &data) {
            self.packet_queue.pop_head();
            if !self.packet_queue.is_empty() {
                let gap = i64::from(self.constants.borrow().interpacket_delay_ms());
                let weak = self.weak_self.clone();
                self.tx_timer =
                    Some(self.timers.new_oneoff_after(TimeVal::from_ms(gap), move || {
                        if let Some(port) = weak.upgrade() {
                            port.borrow_mut().push_packets();
                        }
                    }));
            }
        } else {
            log::warn!("send failed: discarding outbound packets");
            self.packet_queue.flush_packets();
        }
    }

    fn schedule_unsolicited(&mut self) {
        let base_ms = u64::from(self.constants.borrow().unsolicited_response_secs()) * 1000;
        let jitter = base_ms / 6;
        let delay = uniform_ms(base_ms.saturating_sub(jitter), base_ms + jitter);
        let weak = self.weak_self.clone();
        self.us_timer = Some(self.timers.new_oneoff_after(
            TimeVal::from_ms(delay as i64),
            move || {
                if let Some(port) = weak.upgrade() {
                    let mut p = port.borrow_mut();
                    p.unsolicited_update();
                    p.schedule_unsolicited();
                }
            },
        ));
    }

    /// Periodic full-table advertisement to the RIPv2 group.
    fn unsolicited_update(&mut self) {
        if self.enabled && self.advertise {
            self.send_table_response(RIP_V2_GROUP, RIP_PORT);
        }
        // the full table supersedes any queued incremental changes
        self.update_queue.ffwd(&self.uq_reader);
    }

    /// Advertise the changes accumulated since the trigger armed.
    fn triggered_update(&mut self) {
        if !self.enabled || !self.advertise {
            self.update_queue.ffwd(&self.uq_reader);
            return;
        }

        // coalesce: the latest state per prefix wins
        let mut changes: BTreeMap<Ipv4Net, RouteEvent<Ipv4Addr>> = BTreeMap::new();
        while let Some(event) = self.update_queue.get(&self.uq_reader) {
            changes.insert(event.net, event);
            self.update_queue.next(&self.uq_reader);
        }
        if changes.is_empty() {
            return;
        }

        let mut out = Vec::new();
        for event in changes.into_values() {
            let cost = match self.horizon_cost(event.origin_port, event.cost) {
                Some(cost) => cost,
                None => continue,
            };
            let cost = if event.kind == UpdateKind::Delete {
                RIP_INFINITY
            } else {
                cost
            };
            if event.net.is_default() && !self.advertise_default_route {
                continue;
            }
            out.push((event.tag as u16, event.net, event.nexthop, cost));
        }
        if out.is_empty() {
            return;
        }
        self.counters.triggered_updates += 1;
        self.enqueue_response(RIP_V2_GROUP, RIP_PORT, out);
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if let Some(id) = self.uq_observer.take() {
            self.update_queue.unsubscribe(id);
        }
        self.update_queue.destroy_reader(&self.uq_reader);
    }
}
