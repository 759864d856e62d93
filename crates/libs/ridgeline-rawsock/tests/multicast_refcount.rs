//! Socket lifetime and multicast membership refcounting against a
//! recording transport.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use ridgeline_net::{IfTree, IfTreeAddr, IfTreeInterface, IfTreeVif};
use ridgeline_rawsock::{
    DummyTransport, Family, RawSocketManager, RecvMeta, SendSpec, TransportOp,
};

const OSPF_PROTO: u8 = 89;
const GROUP: IpAddr = IpAddr::V4(Ipv4Addr::new(224, 0, 0, 5));

fn iftree() -> Rc<RefCell<IfTree>> {
    let mut tree = IfTree::new();
    tree.set_interface(
        "eth0",
        IfTreeInterface {
            enabled: true,
            mac: None,
            mtu: 1500,
            vifs: BTreeMap::new(),
        },
    );
    tree.set_vif(
        "eth0",
        "eth0",
        IfTreeVif {
            enabled: true,
            pif_index: 7,
            addrs: BTreeMap::new(),
        },
    );
    tree.set_address(
        "eth0",
        "eth0",
        IfTreeAddr {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            enabled: true,
            prefix_len: 24,
            multicast_capable: true,
        },
    );
    Rc::new(RefCell::new(tree))
}

fn manager() -> (RawSocketManager, Rc<RefCell<Vec<TransportOp>>>) {
    let transport = DummyTransport::new();
    let log = transport.log_handle();
    (
        RawSocketManager::new(Box::new(transport), iftree()),
        log,
    )
}

fn count_ops(log: &Rc<RefCell<Vec<TransportOp>>>, pred: impl Fn(&TransportOp) -> bool) -> usize {
    log.borrow().iter().filter(|op| pred(op)).count()
}

fn meta(src: Ipv4Addr, protocol: u8) -> RecvMeta {
    RecvMeta {
        ifindex: 7,
        ifname: "eth0".to_string(),
        vifname: "eth0".to_string(),
        src: IpAddr::V4(src),
        dst: GROUP,
        protocol,
        ttl: 1,
        tos: 0,
        router_alert: true,
        internet_control: false,
        ext_headers_type: Vec::new(),
        ext_headers_payload: Vec::new(),
    }
}

#[test]
fn socket_exists_while_filters_do() {
    let (mut manager, log) = manager();
    assert_eq!(manager.socket_count(), 0);

    manager
        .register_receiver(Family::V4, "ospf-a", "eth0", "eth0", OSPF_PROTO, false, |_, _| {})
        .expect("register a");
    assert_eq!(manager.socket_count(), 1);
    manager
        .register_receiver(Family::V4, "ospf-b", "eth0", "eth0", OSPF_PROTO, false, |_, _| {})
        .expect("register b");
    // still one socket per (family, protocol)
    assert_eq!(manager.socket_count(), 1);
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Open { .. })), 1);

    manager
        .unregister_receiver(Family::V4, "ospf-a", "eth0", "eth0", OSPF_PROTO)
        .expect("unregister a");
    assert_eq!(manager.socket_count(), 1);
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Close { .. })), 0);

    manager
        .unregister_receiver(Family::V4, "ospf-b", "eth0", "eth0", OSPF_PROTO)
        .expect("unregister b");
    assert_eq!(manager.socket_count(), 0);
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Close { .. })), 1);
}

#[test]
fn multicast_membership_is_refcounted() {
    let (mut manager, log) = manager();
    for name in ["ospf-a", "ospf-b"] {
        manager
            .register_receiver(Family::V4, name, "eth0", "eth0", OSPF_PROTO, false, |_, _| {})
            .expect("register");
    }

    manager
        .join_multicast_group(Family::V4, "ospf-a", "eth0", "eth0", OSPF_PROTO, GROUP)
        .expect("join a");
    manager
        .join_multicast_group(Family::V4, "ospf-b", "eth0", "eth0", OSPF_PROTO, GROUP)
        .expect("join b");
    // one kernel join, on the right interface
    assert_eq!(
        count_ops(&log, |op| matches!(
            op,
            TransportOp::Join { pif_index: 7, group, .. } if *group == GROUP
        )),
        1
    );

    // the first unregistration must not leave the group
    manager
        .unregister_receiver(Family::V4, "ospf-a", "eth0", "eth0", OSPF_PROTO)
        .expect("unregister a");
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Leave { .. })), 0);

    // the second does, exactly once
    manager
        .unregister_receiver(Family::V4, "ospf-b", "eth0", "eth0", OSPF_PROTO)
        .expect("unregister b");
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Leave { .. })), 1);
}

#[test]
fn explicit_leave_follows_same_refcount() {
    let (mut manager, log) = manager();
    for name in ["a", "b"] {
        manager
            .register_receiver(Family::V4, name, "eth0", "eth0", OSPF_PROTO, false, |_, _| {})
            .expect("register");
        manager
            .join_multicast_group(Family::V4, name, "eth0", "eth0", OSPF_PROTO, GROUP)
            .expect("join");
    }
    manager
        .leave_multicast_group(Family::V4, "a", "eth0", "eth0", OSPF_PROTO, GROUP)
        .expect("leave a");
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Leave { .. })), 0);
    manager
        .leave_multicast_group(Family::V4, "b", "eth0", "eth0", OSPF_PROTO, GROUP)
        .expect("leave b");
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Leave { .. })), 1);

    // leaving twice is an error
    assert!(manager
        .leave_multicast_group(Family::V4, "b", "eth0", "eth0", OSPF_PROTO, GROUP)
        .is_err());
}

#[test]
fn join_requires_registration() {
    let (mut manager, _log) = manager();
    assert!(manager
        .join_multicast_group(Family::V4, "ghost", "eth0", "eth0", OSPF_PROTO, GROUP)
        .is_err());
}

#[test]
fn dispatch_honors_filters() {
    let (mut manager, _log) = manager();
    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    for (name, loopback) in [("strict", false), ("loopy", true)] {
        let seen = Rc::clone(&seen);
        let tag = name.to_string();
        manager
            .register_receiver(
                Family::V4,
                name,
                "eth0",
                "eth0",
                OSPF_PROTO,
                loopback,
                move |_, _| seen.borrow_mut().push(tag.clone()),
            )
            .expect("register");
    }
    manager.set_local_addresses([IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);

    // remote source: both receivers see it
    manager.dispatch(
        Family::V4,
        OSPF_PROTO,
        &meta(Ipv4Addr::new(10, 0, 0, 2), OSPF_PROTO),
        b"hello",
    );
    assert_eq!(seen.borrow().len(), 2);

    // locally sourced multicast: only the loopback-enabled filter
    seen.borrow_mut().clear();
    manager.dispatch(
        Family::V4,
        OSPF_PROTO,
        &meta(Ipv4Addr::new(10, 0, 0, 1), OSPF_PROTO),
        b"hello",
    );
    assert_eq!(*seen.borrow(), vec!["loopy".to_string()]);

    // wrong interface: nobody
    seen.borrow_mut().clear();
    let mut wrong_if = meta(Ipv4Addr::new(10, 0, 0, 2), OSPF_PROTO);
    wrong_if.ifname = "eth9".to_string();
    manager.dispatch(Family::V4, OSPF_PROTO, &wrong_if, b"hello");
    assert!(seen.borrow().is_empty());
}

#[test]
fn send_without_filters_uses_transient_socket() {
    let (mut manager, log) = manager();
    let spec = SendSpec {
        ifname: "eth0".to_string(),
        vifname: "eth0".to_string(),
        src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        dst: GROUP,
        protocol: OSPF_PROTO,
        ttl: 1,
        tos: 0,
        router_alert: true,
        internet_control: true,
        ext_headers_type: Vec::new(),
        ext_headers_payload: Vec::new(),
        payload: b"payload".to_vec(),
    };
    manager.send(&spec).expect("send");

    // no receivers: the socket existed only for the call
    assert_eq!(manager.socket_count(), 0);
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Open { .. })), 1);
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Send { .. })), 1);
    assert_eq!(count_ops(&log, |op| matches!(op, TransportOp::Close { .. })), 1);
}
