//! Multi-reader log of route change events.
//!
//! Writers append; readers advance independently. An event is retained
//! exactly as long as some live reader has not passed it, so memory is
//! bounded by the slowest reader. Readers created after an event never
//! see it.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use ridgeline_net::{IpNet, RouteAddress};

use crate::policy::PolicyTags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Add,
    Replace,
    Delete,
}

/// Value snapshot of one route change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEvent<A: RouteAddress> {
    pub kind: UpdateKind,
    pub net: IpNet<A>,
    pub nexthop: A,
    pub cost: u32,
    pub tag: u32,
    /// Port the originating peer was learned on; `None` for local
    /// routes.
    pub origin_port: Option<u32>,
    pub policy_tags: PolicyTags,
}

/// Opaque reader handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIterator {
    id: u32,
}

struct UqInner<A: RouteAddress> {
    events: VecDeque<RouteEvent<A>>,
    /// Sequence number of `events.front()`.
    base: u64,
    /// Reader id to the sequence number it reads next.
    readers: BTreeMap<u32, u64>,
    next_reader_id: u32,
    observers: BTreeMap<u32, Rc<dyn Fn()>>,
    next_observer_id: u32,
}

impl<A: RouteAddress> UqInner<A> {
    fn end(&self) -> u64 {
        self.base + self.events.len() as u64
    }

    /// Drop events every reader has passed. With no readers nothing is
    /// retained at all.
    fn collect_garbage(&mut self) {
        let horizon = match self.readers.values().min() {
            Some(min) => *min,
            None => self.end(),
        };
        while self.base < horizon {
            self.events.pop_front();
            self.base += 1;
        }
    }
}

/// Shared handle onto one update queue.
pub struct UpdateQueue<A: RouteAddress> {
    inner: Rc<RefCell<UqInner<A>>>,
}

impl<A: RouteAddress> Clone for UpdateQueue<A> {
    fn clone(&self) -> Self {
        UpdateQueue {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: RouteAddress> Default for UpdateQueue<A> {
    fn default() -> Self {
        UpdateQueue::new()
    }
}

impl<A: RouteAddress> UpdateQueue<A> {
    pub fn new() -> UpdateQueue<A> {
        UpdateQueue {
            inner: Rc::new(RefCell::new(UqInner {
                events: VecDeque::new(),
                base: 0,
                readers: BTreeMap::new(),
                next_reader_id: 0,
                observers: BTreeMap::new(),
                next_observer_id: 0,
            })),
        }
    }

    /// A new reader positioned at the end of the log.
    pub fn create_reader(&self) -> ReadIterator {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_reader_id;
        inner.next_reader_id += 1;
        let end = inner.end();
        inner.readers.insert(id, end);
        ReadIterator { id }
    }

    pub fn destroy_reader(&self, reader: &ReadIterator) {
        let mut inner = self.inner.borrow_mut();
        inner.readers.remove(&reader.id);
        inner.collect_garbage();
    }

    /// Append an event and notify observers.
    pub fn push(&self, event: RouteEvent<A>) {
        let observers: Vec<Rc<dyn Fn()>> = {
            let mut inner = self.inner.borrow_mut();
            inner.events.push_back(event);
            inner.collect_garbage();
            inner.observers.values().cloned().collect()
        };
        for observer in observers {
            observer();
        }
    }

    /// The event under the reader, if any.
    pub fn get(&self, reader: &ReadIterator) -> Option<RouteEvent<A>> {
        let inner = self.inner.borrow();
        let pos = *inner.readers.get(&reader.id)?;
        if pos < inner.end() {
            inner.events.get((pos - inner.base) as usize).cloned()
        } else {
            None
        }
    }

    /// Advance the reader one event; false when already at the end.
    pub fn next(&self, reader: &ReadIterator) -> bool {
        let mut inner = self.inner.borrow_mut();
        let end = inner.end();
        let advanced = match inner.readers.get_mut(&reader.id) {
            Some(pos) if *pos < end => {
                *pos += 1;
                true
            }
            _ => false,
        };
        if advanced {
            inner.collect_garbage();
        }
        advanced
    }

    /// Move the reader past every queued event.
    pub fn ffwd(&self, reader: &ReadIterator) {
        let mut inner = self.inner.borrow_mut();
        let end = inner.end();
        if let Some(pos) = inner.readers.get_mut(&reader.id) {
            *pos = end;
        }
        inner.collect_garbage();
    }

    /// Drop every queued event; all readers land at the end.
    pub fn flush(&self) {
        let mut inner = self.inner.borrow_mut();
        let end = inner.end();
        inner.events.clear();
        inner.base = end;
        for pos in inner.readers.values_mut() {
            *pos = end;
        }
    }

    pub fn updates_queued(&self) -> usize {
        self.inner.borrow().events.len()
    }

    /// Register a callback invoked after every push. Used by ports to
    /// arm their triggered-update timers.
    pub fn subscribe<F>(&self, observer: F) -> u32
    where
        F: Fn() + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_observer_id;
        inner.next_observer_id += 1;
        inner.observers.insert(id, Rc::new(observer));
        id
    }

    pub fn unsubscribe(&self, observer_id: u32) {
        self.inner.borrow_mut().observers.remove(&observer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::Ipv4Addr;

    fn event(kind: UpdateKind, third_octet: u8) -> RouteEvent<Ipv4Addr> {
        RouteEvent {
            kind,
            net: IpNet::new(Ipv4Addr::new(10, 0, third_octet, 0), 24).expect("prefix"),
            nexthop: Ipv4Addr::new(10, 0, 0, 1),
            cost: 5,
            tag: 0,
            origin_port: Some(1),
            policy_tags: PolicyTags::new(),
        }
    }

    #[test]
    fn readers_see_events_exactly_once_in_order() {
        let uq: UpdateQueue<Ipv4Addr> = UpdateQueue::new();
        let reader = uq.create_reader();
        for i in 0..10 {
            uq.push(event(UpdateKind::Add, i));
        }
        for i in 0..10 {
            let got = uq.get(&reader).expect("event");
            assert_eq!(got.net, event(UpdateKind::Add, i).net);
            assert!(uq.next(&reader));
        }
        assert!(uq.get(&reader).is_none());
        assert!(!uq.next(&reader));
    }

    #[test]
    fn slow_reader_pins_events() {
        let uq: UpdateQueue<Ipv4Addr> = UpdateQueue::new();
        let fast = uq.create_reader();
        let slow = uq.create_reader();
        for i in 0..5 {
            uq.push(event(UpdateKind::Add, i));
        }
        for _ in 0..5 {
            uq.next(&fast);
        }
        // the slow reader still pins all five
        assert_eq!(uq.updates_queued(), 5);
        for _ in 0..3 {
            uq.next(&slow);
        }
        assert_eq!(uq.updates_queued(), 2);
        uq.destroy_reader(&slow);
        assert_eq!(uq.updates_queued(), 0);
    }

    #[test]
    fn reader_created_after_event_never_sees_it() {
        let uq: UpdateQueue<Ipv4Addr> = UpdateQueue::new();
        let early = uq.create_reader();
        uq.push(event(UpdateKind::Add, 1));
        let late = uq.create_reader();
        assert!(uq.get(&early).is_some());
        assert!(uq.get(&late).is_none());
    }

    #[test]
    fn no_readers_means_no_retention() {
        let uq: UpdateQueue<Ipv4Addr> = UpdateQueue::new();
        uq.push(event(UpdateKind::Add, 1));
        assert_eq!(uq.updates_queued(), 0);
    }

    #[test]
    fn flush_drops_unobserved_events() {
        let uq: UpdateQueue<Ipv4Addr> = UpdateQueue::new();
        let fast = uq.create_reader();
        let slow = uq.create_reader();
        for i in 0..4 {
            uq.push(event(UpdateKind::Add, i));
        }
        uq.ffwd(&fast);
        assert_eq!(uq.updates_queued(), 4);
        uq.flush();
        assert_eq!(uq.updates_queued(), 0);
        assert!(uq.get(&fast).is_none());
        assert!(uq.get(&slow).is_none());
    }

    #[test]
    fn observers_fire_on_push() {
        let uq: UpdateQueue<Ipv4Addr> = UpdateQueue::new();
        let _reader = uq.create_reader();
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let id = uq.subscribe(move || h.set(h.get() + 1));
        uq.push(event(UpdateKind::Add, 1));
        uq.push(event(UpdateKind::Delete, 1));
        assert_eq!(hits.get(), 2);
        uq.unsubscribe(id);
        uq.push(event(UpdateKind::Add, 2));
        assert_eq!(hits.get(), 2);
    }
}
