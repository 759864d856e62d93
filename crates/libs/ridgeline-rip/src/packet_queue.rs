//! FIFO of packets awaiting transmission on a port.

use std::collections::VecDeque;

use ridgeline_net::RouteAddress;

use crate::constants::DEFAULT_MAX_PACKET_BUFFER_BYTES;
use crate::packets::RipPacket;

/// Bounded outbound packet FIFO.
///
/// When the byte ceiling is exceeded the oldest queued packet is
/// dropped; stale advertisements are worth less than fresh ones.
pub struct PacketQueue<A: RouteAddress> {
    queue: VecDeque<RipPacket<A>>,
    buffered_bytes: usize,
    max_buffered_bytes: usize,
    drops: u32,
}

impl<A: RouteAddress> Default for PacketQueue<A> {
    fn default() -> Self {
        PacketQueue::new()
    }
}

impl<A: RouteAddress> PacketQueue<A> {
    pub fn new() -> PacketQueue<A> {
        PacketQueue {
            queue: VecDeque::new(),
            buffered_bytes: 0,
            max_buffered_bytes: DEFAULT_MAX_PACKET_BUFFER_BYTES,
            drops: 0,
        }
    }

    pub fn enqueue_packet(&mut self, packet: RipPacket<A>) {
        self.buffered_bytes += packet.data_bytes();
        self.queue.push_back(packet);
        while self.buffered_bytes > self.max_buffered_bytes && self.queue.len() > 1 {
            if let Some(dropped) = self.queue.pop_front() {
                self.buffered_bytes -= dropped.data_bytes();
                self.drops += 1;
                log::warn!(
                    "outbound packet buffer over {} bytes; dropped a {}-byte packet",
                    self.max_buffered_bytes,
                    dropped.data_bytes()
                );
            }
        }
    }

    pub fn head(&self) -> Option<&RipPacket<A>> {
        self.queue.front()
    }

    pub fn pop_head(&mut self) {
        if let Some(packet) = self.queue.pop_front() {
            self.buffered_bytes -= packet.data_bytes();
        }
    }

    pub fn flush_packets(&mut self) {
        self.queue.clear();
        self.buffered_bytes = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn buffered_packets(&self) -> usize {
        self.queue.len()
    }

    pub fn drop_count(&self) -> u32 {
        self.drops
    }

    pub fn set_max_buffered_bytes(&mut self, max: usize) {
        self.max_buffered_bytes = max;
    }

    pub fn max_buffered_bytes(&self) -> usize {
        self.max_buffered_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RIP_PORT;
    use crate::packets::{RipCommand, RipPacketHeader, IPV4_VERSION};
    use std::net::Ipv4Addr;

    fn packet(n_blank_entries: usize) -> RipPacket<Ipv4Addr> {
        let header = RipPacketHeader::new(RipCommand::Response, IPV4_VERSION);
        let mut packet = RipPacket::new(Ipv4Addr::new(10, 0, 0, 2), RIP_PORT, header);
        for _ in 0..n_blank_entries {
            packet.append_blank_entry();
        }
        packet
    }

    #[test]
    fn fifo_order() {
        let mut q = PacketQueue::new();
        q.enqueue_packet(packet(1));
        q.enqueue_packet(packet(2));
        assert_eq!(q.buffered_packets(), 2);
        assert_eq!(q.head().expect("head").entry_count(), 1);
        q.pop_head();
        assert_eq!(q.head().expect("head").entry_count(), 2);
        q.pop_head();
        assert!(q.is_empty());
        assert_eq!(q.buffered_bytes(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut q = PacketQueue::new();
        q.set_max_buffered_bytes(100);
        q.enqueue_packet(packet(1)); // 24 bytes
        q.enqueue_packet(packet(2)); // 44 bytes
        q.enqueue_packet(packet(3)); // 64 bytes; total 132 > 100
        assert_eq!(q.drop_count(), 1);
        assert_eq!(q.head().expect("head").entry_count(), 2);
    }

    #[test]
    fn flush_clears_accounting() {
        let mut q = PacketQueue::new();
        q.enqueue_packet(packet(5));
        q.flush_packets();
        assert!(q.is_empty());
        assert_eq!(q.buffered_bytes(), 0);
    }
}
