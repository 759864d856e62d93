//! Authentication checks against captured wire data.

mod support;

use std::net::Ipv4Addr;

use ridgeline_event::TimeVal;
use rip_core::constants::RIP_PORT;
use rip_core::packets::{PacketRouteEntry, RipCommand, RipPacket, RipPacketHeader, IPV4_VERSION};
use rip_core::{AuthHandler, Md5AuthHandler};
use support::manual_timers;

/// An MD5-authenticated RIP response captured on the wire: 11 route
/// entries signed with key ID 1.
#[rustfmt::skip]
const CAPTURED_MD5_PACKET: [u8; 264] = [
    0x02, 0x02, 0x00, 0x00, 0xff, 0xff, 0x00, 0x03,
    0x00, 0xf4, 0x01, 0x14, 0x00, 0x00, 0x01, 0x13,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x02, 0x00, 0x00, 0xc0, 0x96, 0xba, 0x00,
    0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x0c, 0x00, 0x02, 0x00, 0x00,
    0xc0, 0x96, 0xbb, 0xe0, 0xff, 0xff, 0xff, 0xfc,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0c,
    0x00, 0x02, 0x00, 0x00, 0xc0, 0x96, 0xbb, 0xf0,
    0xff, 0xff, 0xff, 0xf8, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x0c, 0x00, 0x02, 0x00, 0x00,
    0xc0, 0x96, 0xbb, 0xf8, 0xff, 0xff, 0xff, 0xf8,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0b,
    0x00, 0x02, 0x00, 0x00, 0xc0, 0xa8, 0x03, 0x00,
    0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x0c, 0x00, 0x02, 0x00, 0x00,
    0xc0, 0xa8, 0x04, 0x00, 0xff, 0xff, 0xff, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0c,
    0x00, 0x02, 0x00, 0x00, 0xc0, 0xa8, 0xfe, 0x01,
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x0c, 0x00, 0x02, 0x00, 0x00,
    0xc0, 0xa8, 0xfe, 0x02, 0xff, 0xff, 0xff, 0xff,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0c,
    0x00, 0x02, 0x00, 0x00, 0xc0, 0xa8, 0xfe, 0x03,
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x0b, 0x00, 0x02, 0x00, 0x00,
    0xc0, 0xa8, 0xfe, 0x04, 0xff, 0xff, 0xff, 0xff,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0c,
    0x00, 0x02, 0x00, 0x00, 0xc0, 0xa8, 0xfe, 0x05,
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x0d, 0xff, 0xff, 0x00, 0x01,
    0x2d, 0xaa, 0xa4, 0xba, 0x2e, 0xfd, 0x5c, 0x0b,
    0x25, 0x44, 0xb5, 0x98, 0xcd, 0x5f, 0x24, 0xab,
];

#[test]
fn captured_md5_packet_authenticates() {
    let (_clock, timers) = manual_timers();
    let mut md5 = Md5AuthHandler::new(timers);
    md5.add_key(1, "bgp@icsi", TimeVal::ZERO, TimeVal::MAXIMUM)
        .expect("add key");
    let mut handler = AuthHandler::Md5(md5);

    let entries = handler
        .authenticate_inbound(&CAPTURED_MD5_PACKET, Ipv4Addr::UNSPECIFIED, false)
        .expect("authentication");
    assert_eq!(entries.n_entries, 11);
    assert_eq!(entries.offset, 24);

    let first = PacketRouteEntry::decode(&CAPTURED_MD5_PACKET[entries.offset..]).expect("entry");
    assert_eq!(first.addr, Ipv4Addr::new(192, 150, 186, 0));
    assert_eq!(first.mask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(first.metric, 12);
}

#[test]
fn captured_md5_packet_rejects_wrong_key() {
    let (_clock, timers) = manual_timers();
    let mut md5 = Md5AuthHandler::new(timers);
    md5.add_key(1, "not the key", TimeVal::ZERO, TimeVal::MAXIMUM)
        .expect("add key");
    let mut handler = AuthHandler::Md5(md5);
    assert!(handler
        .authenticate_inbound(&CAPTURED_MD5_PACKET, Ipv4Addr::UNSPECIFIED, false)
        .is_err());
}

#[test]
fn captured_md5_packet_rejects_any_corruption() {
    let (_clock, timers) = manual_timers();
    let mut md5 = Md5AuthHandler::new(timers);
    md5.add_key(1, "bgp@icsi", TimeVal::ZERO, TimeVal::MAXIMUM)
        .expect("add key");
    let mut handler = AuthHandler::Md5(md5);

    for i in 0..CAPTURED_MD5_PACKET.len() {
        let mut bad = CAPTURED_MD5_PACKET;
        bad[i] ^= 0x01;
        assert!(
            handler
                .authenticate_inbound(&bad, Ipv4Addr::UNSPECIFIED, true)
                .is_err(),
            "corruption at byte {i} was accepted"
        );
    }
}

#[test]
fn plaintext_roundtrip_preserves_entries() {
    let mut handler = AuthHandler::plaintext("16 character password");

    let header = RipPacketHeader::new(RipCommand::Response, IPV4_VERSION);
    let mut packet = RipPacket::new(Ipv4Addr::new(10, 0, 10, 255), RIP_PORT, header);
    packet.append_blank_entry(); // head entry for the password
    let advertised = PacketRouteEntry::new_route(
        1096,
        "10.0.10.0/24".parse().expect("prefix"),
        Ipv4Addr::new(10, 0, 10, 1),
        12,
    );
    for _ in 0..3 {
        packet.append_entry(&advertised);
    }

    let (auth_packets, n_routes) = handler.authenticate_outbound(&packet).expect("outbound");
    assert_eq!(n_routes, 3);
    assert_eq!(auth_packets.len(), 1);

    let entries = handler
        .authenticate_inbound(auth_packets[0].data(), Ipv4Addr::new(10, 0, 10, 1), false)
        .expect("inbound");
    assert_eq!(entries.n_entries, 3);

    for i in 0..3 {
        let offset = entries.offset + i * 20;
        let entry =
            PacketRouteEntry::decode(&auth_packets[0].data()[offset..]).expect("entry");
        assert_eq!(entry, advertised);
    }
}
