//! Table requests, horizon policy, and the interquery throttle across
//! two ports sharing one route database.

mod support;

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use ridgeline_event::{ManualClock, TimerList};
use rip_core::constants::{RIP_INFINITY, RIP_PORT};
use rip_core::{Horizon, Port, RouteDb};
use support::{
    build_response, build_table_request, decode_entries, manual_timers, run_for_secs,
    SentPacket, SpoofPortIo,
};

const PEER_A: Ipv4Addr = Ipv4Addr::new(10, 2, 0, 99);
const QUERIER: Ipv4Addr = Ipv4Addr::new(10, 2, 0, 50);

struct TwoPorts {
    clock: Rc<ManualClock>,
    timers: TimerList,
    port1: Rc<RefCell<Port>>,
    port2: Rc<RefCell<Port>>,
    sent1: Rc<RefCell<Vec<SentPacket>>>,
    sent2: Rc<RefCell<Vec<SentPacket>>>,
}

fn two_ports() -> TwoPorts {
    let (clock, timers) = manual_timers();
    let db: RouteDb<Ipv4Addr> = RouteDb::new(timers.clone());

    let io1 = SpoofPortIo::new("eth1", "eth1", Ipv4Addr::new(10, 1, 0, 1), 1);
    let sent1 = io1.sent_handle();
    let port1 = Port::new(1, Box::new(io1), timers.clone(), db.clone());

    let io2 = SpoofPortIo::new("eth2", "eth2", Ipv4Addr::new(10, 2, 0, 1), 2);
    let sent2 = io2.sent_handle();
    let port2 = Port::new(2, Box::new(io2), timers.clone(), db.clone());

    for port in [&port1, &port2] {
        let mut p = port.borrow_mut();
        p.set_enabled(true);
        p.set_advertise(true);
        p.set_horizon(Horizon::SplitHorizon);
    }
    TwoPorts {
        clock,
        timers,
        port1,
        port2,
        sent1,
        sent2,
    }
}

fn learn_routes_on_port2(fixture: &TwoPorts, n: u8) {
    let routes: Vec<(String, Ipv4Addr, u32, u16)> = (0..n)
        .map(|i| {
            (
                format!("172.16.{i}.0/24"),
                Ipv4Addr::UNSPECIFIED,
                2u32,
                0u16,
            )
        })
        .collect();
    let borrowed: Vec<(&str, Ipv4Addr, u32, u16)> = routes
        .iter()
        .map(|(net, nh, metric, tag)| (net.as_str(), *nh, *metric, *tag))
        .collect();
    let packet = build_response(&borrowed);
    fixture
        .port2
        .borrow_mut()
        .port_io_receive(PEER_A, RIP_PORT, &packet);
}

#[test]
fn split_horizon_suppresses_learned_routes_on_query() {
    let fixture = two_ports();
    learn_routes_on_port2(&fixture, 10);
    assert_eq!(fixture.port2.borrow().route_db().route_count(), 10);

    // query arriving at the port the routes were learned on: split
    // horizon leaves nothing to say
    fixture
        .port2
        .borrow_mut()
        .port_io_receive(QUERIER, 1025, &build_table_request());
    let advertised: usize = fixture
        .sent2
        .borrow()
        .iter()
        .map(|p| decode_entries(&p.data, 0).len())
        .sum();
    assert_eq!(advertised, 0);

    // the same query on the other port reports all ten
    fixture
        .port1
        .borrow_mut()
        .port_io_receive(QUERIER, 1025, &build_table_request());
    let sent = fixture.sent1.borrow();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dst, QUERIER);
    assert_eq!(sent[0].dst_port, 1025);
    let entries = decode_entries(&sent[0].data, 0);
    assert_eq!(entries.len(), 10);
    // advertised metric: learned metric 2 plus the port cost of 1
    assert!(entries.iter().all(|e| e.metric == 3));
}

#[test]
fn poison_reverse_advertises_at_infinity() {
    let fixture = two_ports();
    fixture.port2.borrow_mut().set_horizon(Horizon::PoisonReverse);
    learn_routes_on_port2(&fixture, 10);

    fixture
        .port2
        .borrow_mut()
        .port_io_receive(QUERIER, 1025, &build_table_request());
    let sent = fixture.sent2.borrow();
    assert_eq!(sent.len(), 1);
    let entries = decode_entries(&sent[0].data, 0);
    assert_eq!(entries.len(), 10);
    assert!(entries.iter().all(|e| e.metric == RIP_INFINITY));
}

#[test]
fn interquery_gap_throttles_repeat_queries() {
    let fixture = two_ports();
    learn_routes_on_port2(&fixture, 4);

    // triggered updates to the RIPv2 group may interleave; count only
    // what went back to the querier
    let responses = || {
        fixture
            .sent1
            .borrow()
            .iter()
            .filter(|p| p.dst == QUERIER)
            .count()
    };

    // queries land on port1 where split horizon does not apply
    fixture
        .port1
        .borrow_mut()
        .port_io_receive(QUERIER, 1025, &build_table_request());
    assert_eq!(responses(), 1);

    // an immediate repeat is swallowed by the interquery gap
    fixture
        .port1
        .borrow_mut()
        .port_io_receive(QUERIER, 1025, &build_table_request());
    assert_eq!(responses(), 1);

    // once the gap has elapsed queries are answered again
    run_for_secs(&fixture.clock, &fixture.timers, 2);
    fixture
        .port1
        .borrow_mut()
        .port_io_receive(QUERIER, 1025, &build_table_request());
    assert_eq!(responses(), 2);
}

#[test]
fn specific_net_query_reports_unknown_as_unreachable() {
    let fixture = two_ports();
    learn_routes_on_port2(&fixture, 1);

    let query = {
        use rip_core::packets::{
            PacketRouteEntry, RipCommand, RipPacket, RipPacketHeader, IPV4_VERSION,
        };
        let header = RipPacketHeader::new(RipCommand::Request, IPV4_VERSION);
        let mut packet = RipPacket::new(Ipv4Addr::UNSPECIFIED, RIP_PORT, header);
        packet.append_entry(&PacketRouteEntry::new_route(
            0,
            "172.16.0.0/24".parse().expect("prefix"),
            Ipv4Addr::UNSPECIFIED,
            1,
        ));
        packet.append_entry(&PacketRouteEntry::new_route(
            0,
            "172.99.0.0/24".parse().expect("prefix"),
            Ipv4Addr::UNSPECIFIED,
            1,
        ));
        packet.data().to_vec()
    };

    fixture
        .port1
        .borrow_mut()
        .port_io_receive(QUERIER, 1025, &query);
    let sent = fixture.sent1.borrow();
    assert_eq!(sent.len(), 1);
    let entries = decode_entries(&sent[0].data, 0);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].metric, 3);
    assert_eq!(entries[1].metric, RIP_INFINITY);
}

#[test]
fn triggered_update_fires_within_bounded_delay() {
    let fixture = two_ports();
    learn_routes_on_port2(&fixture, 3);

    // learning on port2 queued change events; port1's triggered update
    // must fire within the [1, 5] second window and advertise them
    run_for_secs(&fixture.clock, &fixture.timers, 6);
    let advertised: usize = fixture
        .sent1
        .borrow()
        .iter()
        .filter(|p| p.dst == Ipv4Addr::new(224, 0, 0, 9))
        .map(|p| decode_entries(&p.data, 0).len())
        .sum();
    assert_eq!(advertised, 3);

    // port2 owns those routes: split horizon keeps its trigger silent
    let poisoned: usize = fixture
        .sent2
        .borrow()
        .iter()
        .filter(|p| p.dst == Ipv4Addr::new(224, 0, 0, 9))
        .map(|p| decode_entries(&p.data, 0).len())
        .sum();
    assert_eq!(poisoned, 0);
}
