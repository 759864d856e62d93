//! Readiness multiplexing over poll(2).
//!
//! Each file descriptor carries up to three slots (read, write,
//! exception), each with its own priority and callback. A single
//! `wait_and_dispatch` invocation performs one readiness call and then
//! dispatches at most one slot: the highest-priority ready slot, ties
//! broken by a round-robin rotation starting one past the last-served
//! descriptor so no descriptor starves.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::clock::Clock;
use crate::timeval::TimeVal;

/// I/O readiness classes a callback can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoEventType {
    Read,
    Write,
    Exception,
    /// Matches every class; only meaningful for removal.
    Any,
}

const SLOT_READ: usize = 0;
const SLOT_WRITE: usize = 1;
const SLOT_EXCEPTION: usize = 2;
const SLOT_COUNT: usize = 3;

fn slot_index(event: IoEventType) -> Option<usize> {
    match event {
        IoEventType::Read => Some(SLOT_READ),
        IoEventType::Write => Some(SLOT_WRITE),
        IoEventType::Exception => Some(SLOT_EXCEPTION),
        IoEventType::Any => None,
    }
}

fn slot_event(slot: usize) -> IoEventType {
    match slot {
        SLOT_READ => IoEventType::Read,
        SLOT_WRITE => IoEventType::Write,
        _ => IoEventType::Exception,
    }
}

fn slot_poll_bits(slot: usize) -> libc::c_short {
    match slot {
        SLOT_READ => libc::POLLIN,
        SLOT_WRITE => libc::POLLOUT,
        _ => libc::POLLPRI,
    }
}

type IoCallback = Rc<RefCell<Box<dyn FnMut(RawFd, IoEventType)>>>;

#[derive(Clone)]
struct Slot {
    priority: i32,
    callback: IoCallback,
}

#[derive(Default)]
struct Node {
    slots: [Option<Slot>; SLOT_COUNT],
}

impl Node {
    fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    fn poll_events(&self) -> libc::c_short {
        let mut events = 0;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                events |= slot_poll_bits(idx);
            }
        }
        events
    }
}

/// Hook notified when descriptors are registered and unregistered.
pub trait SelectorObserver {
    fn notify_added(&self, fd: RawFd, event: IoEventType);
    fn notify_removed(&self, fd: RawFd, event: IoEventType);
}

struct SelectorInner {
    nodes: BTreeMap<RawFd, Node>,
    last_served_fd: RawFd,
    last_served_slot: usize,
    observer: Option<Rc<dyn SelectorObserver>>,
}

/// Per-descriptor callback table plus the one-shot dispatch policy.
///
/// Cloning yields another handle onto the same table.
pub struct SelectorList {
    clock: Rc<dyn Clock>,
    inner: Rc<RefCell<SelectorInner>>,
}

impl Clone for SelectorList {
    fn clone(&self) -> Self {
        SelectorList {
            clock: Rc::clone(&self.clock),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl SelectorList {
    pub fn new(clock: Rc<dyn Clock>) -> SelectorList {
        SelectorList {
            clock,
            inner: Rc::new(RefCell::new(SelectorInner {
                nodes: BTreeMap::new(),
                last_served_fd: -1,
                last_served_slot: SLOT_COUNT - 1,
                observer: None,
            })),
        }
    }

    /// Register `cb` for `event` readiness on `fd`.
    ///
    /// At most one callback per `(fd, class)`; a second registration for
    /// an occupied slot fails.
    pub fn add_ioevent_cb<F>(&self, fd: RawFd, event: IoEventType, cb: F, priority: i32) -> bool
    where
        F: FnMut(RawFd, IoEventType) + 'static,
    {
        if fd < 0 {
            log::error!("refusing to register invalid descriptor {fd}");
            return false;
        }
        let idx = match slot_index(event) {
            Some(idx) => idx,
            None => {
                log::error!("cannot register for IoEventType::Any");
                return false;
            }
        };
        let mut inner = self.inner.borrow_mut();
        let node = inner.nodes.entry(fd).or_default();
        if node.slots[idx].is_some() {
            return false;
        }
        node.slots[idx] = Some(Slot {
            priority,
            callback: Rc::new(RefCell::new(Box::new(cb))),
        });
        if let Some(observer) = inner.observer.clone() {
            observer.notify_added(fd, event);
        }
        true
    }

    /// Remove the callback(s) registered for `event` on `fd`.
    pub fn remove_ioevent_cb(&self, fd: RawFd, event: IoEventType) {
        let mut inner = self.inner.borrow_mut();
        let observer = inner.observer.clone();
        let node = match inner.nodes.get_mut(&fd) {
            Some(node) => node,
            None => return,
        };
        for idx in 0..SLOT_COUNT {
            let matches = match slot_index(event) {
                Some(want) => want == idx,
                None => true,
            };
            if matches && node.slots[idx].take().is_some() {
                if let Some(observer) = &observer {
                    observer.notify_removed(fd, slot_event(idx));
                }
            }
        }
        if node.is_empty() {
            inner.nodes.remove(&fd);
        }
    }

    pub fn descriptor_count(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    pub fn set_observer(&self, observer: Rc<dyn SelectorObserver>) {
        self.inner.borrow_mut().observer = Some(observer);
    }

    pub fn remove_observer(&self) {
        self.inner.borrow_mut().observer = None;
    }

    /// Wait for readiness for at most `timeout`, then dispatch at most
    /// one callback. Returns the number dispatched (0 or 1).
    pub fn wait_and_dispatch(&self, timeout: TimeVal) -> usize {
        let mut pollfds: Vec<libc::pollfd> = {
            let inner = self.inner.borrow();
            inner
                .nodes
                .iter()
                .map(|(fd, node)| libc::pollfd {
                    fd: *fd,
                    events: node.poll_events(),
                    revents: 0,
                })
                .collect()
        };

        let timeout_ms: libc::c_int = if timeout == TimeVal::MAXIMUM {
            -1
        } else {
            timeout.to_ms().clamp(0, i64::from(libc::c_int::MAX)) as libc::c_int
        };

        let n = if pollfds.is_empty() {
            // nothing registered; still honor the timeout
            unsafe { libc::poll(std::ptr::null_mut(), 0, timeout_ms) }
        } else {
            unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) }
        };
        self.clock.advance_time();

        if n < 0 {
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::EBADF) => self.callback_bad_descriptors(),
                err => log::error!("poll failed: {err:?}"),
            }
            return 0;
        }
        if n == 0 {
            return 0;
        }

        // Collect ready (fd, slot, priority) tuples. Error conditions are
        // reported through every registered slot so the owner notices and
        // unregisters.
        let mut ready: Vec<(RawFd, usize, i32)> = Vec::new();
        {
            let inner = self.inner.borrow();
            for pfd in &pollfds {
                if pfd.revents == 0 {
                    continue;
                }
                let node = match inner.nodes.get(&pfd.fd) {
                    Some(node) => node,
                    None => continue,
                };
                let error = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
                for (idx, slot) in node.slots.iter().enumerate() {
                    let slot = match slot {
                        Some(slot) => slot,
                        None => continue,
                    };
                    if error || pfd.revents & slot_poll_bits(idx) != 0 {
                        ready.push((pfd.fd, idx, slot.priority));
                    }
                }
            }
        }
        if ready.is_empty() {
            return 0;
        }

        let (fd, slot_idx) = self.pick(&ready);
        self.dispatch_one(fd, slot_idx)
    }

    /// Choose the ready slot to serve: lowest priority number wins; ties
    /// resolve in rotation order starting one past the last-served slot.
    fn pick(&self, ready: &[(RawFd, usize, i32)]) -> (RawFd, usize) {
        let (last_fd, last_slot) = {
            let inner = self.inner.borrow();
            (inner.last_served_fd, inner.last_served_slot)
        };

        let rank = |fd: RawFd, slot: usize| -> (u8, i64, usize) {
            if fd == last_fd {
                if slot > last_slot {
                    (0, 0, slot)
                } else {
                    (3, 0, slot)
                }
            } else if fd > last_fd {
                (1, i64::from(fd), slot)
            } else {
                (2, i64::from(fd), slot)
            }
        };

        let mut best: Option<(i32, (u8, i64, usize), RawFd, usize)> = None;
        for &(fd, slot, priority) in ready {
            let key = (priority, rank(fd, slot), fd, slot);
            match &best {
                Some((bp, br, _, _)) if (*bp, *br) <= (key.0, key.1) => {}
                _ => best = Some(key),
            }
        }
        let (_, _, fd, slot) = best.expect("ready list is non-empty");
        (fd, slot)
    }

    fn dispatch_one(&self, fd: RawFd, slot_idx: usize) -> usize {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            inner.last_served_fd = fd;
            inner.last_served_slot = slot_idx;
            inner
                .nodes
                .get(&fd)
                .and_then(|node| node.slots[slot_idx].as_ref())
                .map(|slot| Rc::clone(&slot.callback))
        };
        match callback {
            Some(cb) => {
                (cb.borrow_mut())(fd, slot_event(slot_idx));
                1
            }
            None => 0,
        }
    }

    /// Readiness reported a stale descriptor: probe every registered fd
    /// and run the callbacks of the dead ones so their owners can
    /// unregister. Never fatal.
    fn callback_bad_descriptors(&self) {
        let fds: Vec<RawFd> = self.inner.borrow().nodes.keys().copied().collect();
        let mut bad = 0;
        for fd in fds {
            let mut sb: libc::stat = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::fstat(fd, &mut sb) };
            if rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::EBADF) {
                continue;
            }
            bad += 1;
            log::error!("descriptor {fd} is no longer valid; dispatching error callbacks");
            for slot_idx in 0..SLOT_COUNT {
                let callback = {
                    let inner = self.inner.borrow();
                    inner
                        .nodes
                        .get(&fd)
                        .and_then(|node| node.slots[slot_idx].as_ref())
                        .map(|slot| Rc::clone(&slot.callback))
                };
                if let Some(cb) = callback {
                    (cb.borrow_mut())(fd, slot_event(slot_idx));
                }
            }
        }
        if bad == 0 {
            log::warn!("EBADF from poll but no stale descriptor found");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::task::PRIORITY_DEFAULT;
    use std::cell::Cell;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn write_byte(fd: RawFd) {
        let b = [0u8; 1];
        let rc = unsafe { libc::write(fd, b.as_ptr().cast(), 1) };
        assert_eq!(rc, 1);
    }

    fn drain(fd: RawFd) {
        let mut b = [0u8; 16];
        unsafe { libc::read(fd, b.as_mut_ptr().cast(), b.len()) };
    }

    fn selector() -> SelectorList {
        SelectorList::new(Rc::new(SystemClock::new()))
    }

    #[test]
    fn one_callback_per_slot() {
        let s = selector();
        let (r, w) = pipe();
        assert!(s.add_ioevent_cb(r, IoEventType::Read, |_, _| {}, PRIORITY_DEFAULT));
        assert!(!s.add_ioevent_cb(r, IoEventType::Read, |_, _| {}, PRIORITY_DEFAULT));
        assert_eq!(s.descriptor_count(), 1);
        s.remove_ioevent_cb(r, IoEventType::Any);
        assert_eq!(s.descriptor_count(), 0);
        close(r);
        close(w);
    }

    #[test]
    fn dispatches_exactly_one_per_wait() {
        let s = selector();
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let hits = Rc::new(Cell::new(0u32));
        for r in [r1, r2] {
            let h = hits.clone();
            s.add_ioevent_cb(
                r,
                IoEventType::Read,
                move |fd, _| {
                    h.set(h.get() + 1);
                    drain(fd);
                },
                PRIORITY_DEFAULT,
            );
        }
        write_byte(w1);
        write_byte(w2);
        assert_eq!(s.wait_and_dispatch(TimeVal::ZERO), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(s.wait_and_dispatch(TimeVal::ZERO), 1);
        assert_eq!(hits.get(), 2);
        assert_eq!(s.wait_and_dispatch(TimeVal::ZERO), 0);
        for fd in [r1, w1, r2, w2] {
            close(fd);
        }
    }

    #[test]
    fn round_robin_between_equal_priorities() {
        let s = selector();
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let order = Rc::new(RefCell::new(Vec::new()));
        for r in [r1, r2] {
            let o = order.clone();
            s.add_ioevent_cb(
                r,
                IoEventType::Read,
                move |fd, _| o.borrow_mut().push(fd),
                PRIORITY_DEFAULT,
            );
        }
        // both stay permanently readable; service must alternate
        write_byte(w1);
        write_byte(w2);
        for _ in 0..4 {
            s.wait_and_dispatch(TimeVal::ZERO);
        }
        let served = order.borrow().clone();
        assert_eq!(served.len(), 4);
        assert_ne!(served[0], served[1]);
        assert_ne!(served[1], served[2]);
        assert_ne!(served[2], served[3]);
        for fd in [r1, w1, r2, w2] {
            close(fd);
        }
    }

    #[test]
    fn priority_beats_rotation() {
        let s = selector();
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        s.add_ioevent_cb(
            r1,
            IoEventType::Read,
            move |fd, _| o.borrow_mut().push(fd),
            PRIORITY_DEFAULT,
        );
        let o = order.clone();
        s.add_ioevent_cb(
            r2,
            IoEventType::Read,
            move |fd, _| o.borrow_mut().push(fd),
            PRIORITY_HIGHEST,
        );
        write_byte(w1);
        write_byte(w2);
        for _ in 0..3 {
            s.wait_and_dispatch(TimeVal::ZERO);
        }
        // r2 outranks r1 every time while both are ready
        assert_eq!(*order.borrow(), vec![r2, r2, r2]);
        for fd in [r1, w1, r2, w2] {
            close(fd);
        }
    }

    use crate::task::PRIORITY_HIGHEST;
    use std::cell::RefCell;

    #[test]
    fn removal_from_within_callback_is_safe() {
        let s = selector();
        let (r, w) = pipe();
        let s2 = s.clone();
        assert!(s.add_ioevent_cb(
            r,
            IoEventType::Read,
            move |fd, _| {
                s2.remove_ioevent_cb(fd, IoEventType::Any);
            },
            PRIORITY_DEFAULT,
        ));
        write_byte(w);
        assert_eq!(s.wait_and_dispatch(TimeVal::ZERO), 1);
        assert_eq!(s.descriptor_count(), 0);
        close(r);
        close(w);
    }
}
