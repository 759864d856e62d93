//! Route timer lifecycles at scale, driven over simulated time.

mod support;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::rc::Rc;

use ridgeline_net::IpNet;
use rip_core::{PolicyTags, PortTimerConstants, RouteDb, RouteOrigin, UpdateKind};
use support::{manual_timers, run_for_secs};

const N_TEST_ROUTES: u32 = 32_000;

/// Deterministic pseudo-random prefix generator.
struct NetGenerator {
    state: u64,
    tick: u32,
}

impl NetGenerator {
    fn new() -> NetGenerator {
        NetGenerator {
            state: 883_652_921,
            tick: 0,
        }
    }

    fn next_word(&mut self) -> u32 {
        self.state = (self.state.wrapping_mul(37).wrapping_add(1)) & 0xffff_ffff;
        self.tick = self.tick.wrapping_add(1);
        (self.state as u32) ^ self.tick
    }

    fn make_nets(&mut self, n: u32) -> BTreeSet<IpNet<Ipv4Addr>> {
        let mut nets = BTreeSet::new();
        while nets.len() < n as usize {
            let addr = Ipv4Addr::from(self.next_word());
            let prefix_len = 1 + (self.next_word() % 32) as u8;
            if let Ok(net) = IpNet::new(addr, prefix_len) {
                nets.insert(net);
            }
        }
        nets
    }
}

#[test]
fn mass_expiry_reaches_zero_with_matching_deletes() {
    let (clock, timers) = manual_timers();
    let db: RouteDb<Ipv4Addr> = RouteDb::new(timers.clone());

    let constants = Rc::new(RefCell::new(PortTimerConstants::default()));
    constants.borrow_mut().set_expiry_secs(3);
    constants.borrow_mut().set_deletion_secs(2);
    let origin = RouteOrigin::new_peer(1, Ipv4Addr::new(10, 10, 0, 1), constants);

    let uq = db.update_queue();
    let reader = uq.create_reader();

    let nets = NetGenerator::new().make_nets(N_TEST_ROUTES);
    assert_eq!(nets.len() as u32, N_TEST_ROUTES);
    for net in &nets {
        assert!(db.update_route(
            *net,
            Ipv4Addr::new(10, 0, 0, 1),
            "eth0",
            "eth0",
            1,
            0,
            &origin,
            PolicyTags::new(),
            false,
        ));
    }
    assert_eq!(db.route_count() as u32, N_TEST_ROUTES);
    assert_eq!(origin.route_count() as u32, N_TEST_ROUTES);
    assert_eq!(uq.updates_queued() as u32, N_TEST_ROUTES);

    // consume the ADDs
    let mut adds = 0;
    while let Some(event) = uq.get(&reader) {
        assert_eq!(event.kind, UpdateKind::Add);
        adds += 1;
        uq.next(&reader);
    }
    assert_eq!(adds, N_TEST_ROUTES);

    // expiry at 3 s, deletion at 2 s: everything is gone by 6 s
    run_for_secs(&clock, &timers, 6);
    assert_eq!(db.route_count(), 0);
    assert_eq!(origin.route_count(), 0);

    let mut poisons = 0;
    let mut deletes = 0;
    while let Some(event) = uq.get(&reader) {
        match event.kind {
            UpdateKind::Replace => {
                assert_eq!(event.cost, 16);
                poisons += 1;
            }
            UpdateKind::Delete => deletes += 1,
            UpdateKind::Add => panic!("unexpected ADD after expiry"),
        }
        uq.next(&reader);
    }
    assert_eq!(poisons, N_TEST_ROUTES);
    assert_eq!(deletes, N_TEST_ROUTES);
    assert_eq!(uq.updates_queued(), 0);
}

#[test]
fn refreshed_routes_survive_unrefreshed_neighbors_expire() {
    let (clock, timers) = manual_timers();
    let db: RouteDb<Ipv4Addr> = RouteDb::new(timers.clone());
    let constants = Rc::new(RefCell::new(PortTimerConstants::default()));
    constants.borrow_mut().set_expiry_secs(10);
    constants.borrow_mut().set_deletion_secs(5);
    let origin = RouteOrigin::new_peer(1, Ipv4Addr::new(10, 10, 0, 1), constants);

    let kept: IpNet<Ipv4Addr> = "10.0.1.0/24".parse().expect("prefix");
    let lost: IpNet<Ipv4Addr> = "10.0.2.0/24".parse().expect("prefix");
    for net in [kept, lost] {
        db.update_route(
            net,
            Ipv4Addr::new(10, 0, 0, 1),
            "eth0",
            "eth0",
            2,
            0,
            &origin,
            PolicyTags::new(),
            false,
        );
    }

    // refresh only one of the two routes every 8 simulated seconds
    for _ in 0..4 {
        run_for_secs(&clock, &timers, 8);
        db.update_route(
            kept,
            Ipv4Addr::new(10, 0, 0, 1),
            "eth0",
            "eth0",
            2,
            0,
            &origin,
            PolicyTags::new(),
            false,
        );
    }

    assert!(db.find_route(&kept).is_some());
    assert!(db.find_route(&lost).is_none());
}
