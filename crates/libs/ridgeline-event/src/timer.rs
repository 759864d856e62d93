//! Scheduled one-off and periodic callbacks.
//!
//! A [`Timer`] handle must be kept alive for its callback to remain
//! scheduled; dropping the last handle unschedules it. Cancellation of an
//! expired-but-not-yet-dispatched timer is honored: the callback will not
//! fire.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};

use crate::clock::Clock;
use crate::task::PRIORITY_DEFAULT;
use crate::timeval::TimeVal;

enum TimerKind {
    Oneoff(Option<Box<dyn FnMut()>>),
    Periodic {
        period: TimeVal,
        // taken out of the entry for the duration of the dispatch so the
        // callback may touch its own Timer handle
        callback: Option<Box<dyn FnMut() -> bool>>,
    },
}

struct TimerEntry {
    expiry: TimeVal,
    #[allow(dead_code)]
    priority: i32,
    scheduled: bool,
    kind: TimerKind,
}

struct HeapItem {
    expiry: TimeVal,
    seq: u64,
    entry: Weak<RefCell<TimerEntry>>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.seq == other.seq
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline and,
        // for equal deadlines, the earliest registration pops first.
        (other.expiry, other.seq).cmp(&(self.expiry, self.seq))
    }
}

struct TimerListInner {
    heap: BinaryHeap<HeapItem>,
    next_seq: u64,
}

impl TimerListInner {
    fn push(&mut self, entry: &Rc<RefCell<TimerEntry>>) {
        let expiry = entry.borrow().expiry;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapItem {
            expiry,
            seq,
            entry: Rc::downgrade(entry),
        });
    }
}

/// Handle to a scheduled timer.
///
/// The handle owns the schedule: dropping it removes the timer from the
/// list, and `unschedule` cancels without dropping.
pub struct Timer {
    entry: Rc<RefCell<TimerEntry>>,
}

impl Timer {
    pub fn scheduled(&self) -> bool {
        self.entry.borrow().scheduled
    }

    pub fn unschedule(&self) {
        self.entry.borrow_mut().scheduled = false;
    }
}

/// Min-heap of scheduled callbacks keyed by expiry time.
///
/// Cloning yields another handle onto the same list.
pub struct TimerList {
    clock: Rc<dyn Clock>,
    inner: Rc<RefCell<TimerListInner>>,
}

impl Clone for TimerList {
    fn clone(&self) -> Self {
        TimerList {
            clock: Rc::clone(&self.clock),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl TimerList {
    pub fn new(clock: Rc<dyn Clock>) -> TimerList {
        TimerList {
            clock,
            inner: Rc::new(RefCell::new(TimerListInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            })),
        }
    }

    pub fn advance_time(&self) {
        self.clock.advance_time();
    }

    pub fn current_time(&self) -> TimeVal {
        self.clock.current_time()
    }

    /// Schedule `cb` to run once at the absolute time `when`.
    pub fn new_oneoff_at<F>(&self, when: TimeVal, cb: F) -> Timer
    where
        F: FnMut() + 'static,
    {
        self.oneoff(when, Box::new(cb), PRIORITY_DEFAULT)
    }

    /// Schedule `cb` to run once after `delay`.
    pub fn new_oneoff_after<F>(&self, delay: TimeVal, cb: F) -> Timer
    where
        F: FnMut() + 'static,
    {
        let when = self.clock.current_time().saturating_add(delay);
        self.oneoff(when, Box::new(cb), PRIORITY_DEFAULT)
    }

    /// Schedule `cb` to run every `period`. The callback returns whether
    /// it wants to remain scheduled.
    pub fn new_periodic<F>(&self, period: TimeVal, cb: F) -> Timer
    where
        F: FnMut() -> bool + 'static,
    {
        let entry = Rc::new(RefCell::new(TimerEntry {
            expiry: self.clock.current_time().saturating_add(period),
            priority: PRIORITY_DEFAULT,
            scheduled: true,
            kind: TimerKind::Periodic {
                period,
                callback: Some(Box::new(cb)),
            },
        }));
        self.inner.borrow_mut().push(&entry);
        Timer { entry }
    }

    /// Set `flag` to true at the absolute time `when`.
    pub fn set_flag_at(&self, when: TimeVal, flag: &Rc<Cell<bool>>) -> Timer {
        let flag = Rc::clone(flag);
        self.new_oneoff_at(when, move || flag.set(true))
    }

    /// Set `flag` to true after `delay`.
    pub fn set_flag_after(&self, delay: TimeVal, flag: &Rc<Cell<bool>>) -> Timer {
        let flag = Rc::clone(flag);
        self.new_oneoff_after(delay, move || flag.set(true))
    }

    fn oneoff(&self, when: TimeVal, cb: Box<dyn FnMut()>, priority: i32) -> Timer {
        let entry = Rc::new(RefCell::new(TimerEntry {
            expiry: when,
            priority,
            scheduled: true,
            kind: TimerKind::Oneoff(Some(cb)),
        }));
        self.inner.borrow_mut().push(&entry);
        Timer { entry }
    }

    /// Delay until the earliest live timer fires: `ZERO` when one is
    /// already due, `MAXIMUM` when the list is empty.
    pub fn next_delay(&self) -> TimeVal {
        let now = self.clock.current_time();
        let mut inner = self.inner.borrow_mut();
        loop {
            let live = match inner.heap.peek() {
                None => return TimeVal::MAXIMUM,
                Some(item) => match item.entry.upgrade() {
                    Some(entry) => {
                        let e = entry.borrow();
                        if e.scheduled && e.expiry == item.expiry {
                            return if item.expiry <= now {
                                TimeVal::ZERO
                            } else {
                                item.expiry - now
                            };
                        }
                        false
                    }
                    None => false,
                },
            };
            debug_assert!(!live);
            inner.heap.pop();
        }
    }

    /// Fire every timer whose deadline has passed, in deadline order.
    ///
    /// Timers scheduled from within a callback are deferred to the next
    /// invocation even if already due, so a callback rescheduling itself
    /// at time zero cannot monopolize the loop.
    pub fn run_due(&self) -> usize {
        let now = self.clock.current_time();
        let mut due: Vec<Rc<RefCell<TimerEntry>>> = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            loop {
                let has_due = inner
                    .heap
                    .peek()
                    .map(|item| item.expiry <= now)
                    .unwrap_or(false);
                if !has_due {
                    break;
                }
                let item = match inner.heap.pop() {
                    Some(item) => item,
                    None => break,
                };
                if let Some(entry) = item.entry.upgrade() {
                    let live = {
                        let e = entry.borrow();
                        e.scheduled && e.expiry == item.expiry
                    };
                    if live {
                        due.push(entry);
                    }
                }
            }
        }

        let mut n_fired = 0;
        for entry in due {
            // an earlier callback in this batch may have cancelled it
            let kind = {
                let mut e = entry.borrow_mut();
                if !e.scheduled {
                    continue;
                }
                e.scheduled = false;
                match &mut e.kind {
                    TimerKind::Oneoff(cb) => cb.take().map(DueKind::Oneoff),
                    TimerKind::Periodic { period, callback } => {
                        let period = *period;
                        callback.take().map(|cb| DueKind::Periodic(period, cb))
                    }
                }
            };
            match kind {
                None => continue,
                Some(DueKind::Oneoff(mut cb)) => {
                    cb();
                    n_fired += 1;
                }
                Some(DueKind::Periodic(period, mut cb)) => {
                    let keep = cb();
                    n_fired += 1;
                    let mut e = entry.borrow_mut();
                    if let TimerKind::Periodic { callback, .. } = &mut e.kind {
                        *callback = Some(cb);
                    }
                    if keep && !e.scheduled {
                        let mut next = e.expiry + period;
                        if next <= now {
                            // never fire back-to-back to catch up
                            log::warn!(
                                "periodic timer overran its {}s period; skipping missed ticks",
                                period
                            );
                            next = now + period;
                        }
                        e.expiry = next;
                        e.scheduled = true;
                        drop(e);
                        self.inner.borrow_mut().push(&entry);
                    }
                }
            }
        }
        n_fired
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of live scheduled timers.
    pub fn size(&self) -> usize {
        self.inner
            .borrow()
            .heap
            .iter()
            .filter(|item| match item.entry.upgrade() {
                Some(entry) => {
                    let e = entry.borrow();
                    e.scheduled && e.expiry == item.expiry
                }
                None => false,
            })
            .count()
    }
}

enum DueKind {
    Oneoff(Box<dyn FnMut()>),
    Periodic(TimeVal, Box<dyn FnMut() -> bool>),
}
