//! The loop that binds timers, tasks and readiness dispatch.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::clock::{Clock, SystemClock};
use crate::selector::{IoEventType, SelectorList};
use crate::signals;
use crate::task::{Task, TaskList, PRIORITY_HIGHEST};
use crate::timer::{Timer, TimerList};
use crate::timeval::TimeVal;

/// Ceiling on any single readiness wait in milliseconds, to bound timer
/// jitter.
const MAX_WAIT_MS: i64 = 100;

/// Ceiling on the wait in milliseconds once shutdown has been requested.
const SHUTDOWN_WAIT_MS: i64 = 1000;

/// Warn when `run` is starved for this many seconds between calls.
const STARVATION_WARN_SECS: i64 = 5;

/// Single-threaded cooperative dispatcher.
///
/// Each [`EventLoop::run`] iteration advances the clock, fires due
/// timers in deadline order, runs one background task round, then waits
/// for I/O readiness bounded by the next timer deadline (capped at
/// ~100 ms) and dispatches at most one readiness callback.
pub struct EventLoop {
    clock: Rc<dyn Clock>,
    timers: TimerList,
    tasks: TaskList,
    selector: SelectorList,
    last_run_sec: Cell<i64>,
    last_warned_sec: Cell<i64>,
    // the self-pipe read side stays registered for the loop's lifetime
    _wake_fd: RawFd,
}

impl EventLoop {
    /// Build a loop over the system monotonic clock and install the
    /// default signal handlers.
    pub fn new() -> EventLoop {
        EventLoop::with_clock(Rc::new(SystemClock::new()))
    }

    /// Build a loop over an injected clock (manual clocks for tests).
    pub fn with_clock(clock: Rc<dyn Clock>) -> EventLoop {
        let timers = TimerList::new(Rc::clone(&clock));
        let selector = SelectorList::new(Rc::clone(&clock));
        let wake_fd = signals::install_default_handlers();
        if wake_fd >= 0 {
            selector.add_ioevent_cb(
                wake_fd,
                IoEventType::Read,
                |fd, _| signals::drain_wakeups(fd),
                PRIORITY_HIGHEST,
            );
        }
        EventLoop {
            clock,
            timers,
            tasks: TaskList::new(),
            selector,
            last_run_sec: Cell::new(0),
            last_warned_sec: Cell::new(0),
            _wake_fd: wake_fd,
        }
    }

    pub fn timer_list(&self) -> &TimerList {
        &self.timers
    }

    pub fn task_list(&self) -> &TaskList {
        &self.tasks
    }

    pub fn selector_list(&self) -> &SelectorList {
        &self.selector
    }

    pub fn current_time(&self) -> TimeVal {
        self.clock.current_time()
    }

    pub fn timers_pending(&self) -> bool {
        !self.timers.empty()
    }

    pub fn events_pending(&self) -> bool {
        !self.timers.empty() || !self.tasks.empty()
    }

    pub fn descriptor_count(&self) -> usize {
        self.selector.descriptor_count()
    }

    pub fn new_oneoff_at<F>(&self, when: TimeVal, cb: F) -> Timer
    where
        F: FnMut() + 'static,
    {
        self.timers.new_oneoff_at(when, cb)
    }

    pub fn new_oneoff_after<F>(&self, delay: TimeVal, cb: F) -> Timer
    where
        F: FnMut() + 'static,
    {
        self.timers.new_oneoff_after(delay, cb)
    }

    pub fn new_periodic<F>(&self, period: TimeVal, cb: F) -> Timer
    where
        F: FnMut() -> bool + 'static,
    {
        self.timers.new_periodic(period, cb)
    }

    pub fn set_flag_at(&self, when: TimeVal, flag: &Rc<Cell<bool>>) -> Timer {
        self.timers.set_flag_at(when, flag)
    }

    pub fn set_flag_after(&self, delay: TimeVal, flag: &Rc<Cell<bool>>) -> Timer {
        self.timers.set_flag_after(delay, flag)
    }

    pub fn new_oneoff_task<F>(&self, cb: F, priority: i32, weight: u32) -> Task
    where
        F: FnMut() + 'static,
    {
        self.tasks.new_oneoff_task(cb, priority, weight)
    }

    pub fn new_repeated_task<F>(&self, cb: F, priority: i32, weight: u32) -> Task
    where
        F: FnMut() -> bool + 'static,
    {
        self.tasks.new_repeated_task(cb, priority, weight)
    }

    pub fn add_ioevent_cb<F>(&self, fd: RawFd, event: IoEventType, cb: F, priority: i32) -> bool
    where
        F: FnMut(RawFd, IoEventType) + 'static,
    {
        self.selector.add_ioevent_cb(fd, event, cb, priority)
    }

    pub fn remove_ioevent_cb(&self, fd: RawFd, event: IoEventType) {
        self.selector.remove_ioevent_cb(fd, event)
    }

    /// Whether a shutdown signal or request has been observed.
    pub fn shutdown_requested(&self) -> bool {
        signals::shutdown_requested()
    }

    /// One scheduling cycle: timers, then tasks, then a bounded
    /// readiness wait dispatching at most one I/O callback.
    pub fn run(&self) {
        self.clock.advance_time();
        let now_sec = self.clock.current_time().sec();
        let last = self.last_run_sec.get();
        if last != 0 {
            let gap = now_sec - last;
            if gap > STARVATION_WARN_SECS && now_sec > self.last_warned_sec.get() {
                log::warn!("{gap} seconds between event loop iterations");
                self.last_warned_sec.set(now_sec);
            }
        }

        self.do_work();

        // the readiness wait may have taken a while; re-stamp
        self.clock.advance_time();
        self.last_run_sec.set(self.clock.current_time().sec());
    }

    /// Run until `flag` becomes true or shutdown is requested.
    pub fn run_until(&self, flag: &Rc<Cell<bool>>) {
        while !flag.get() && !self.shutdown_requested() {
            self.run();
        }
    }

    fn do_work(&self) {
        let mut wait = self.timers.next_delay();

        if wait.is_zero() {
            let before = self.clock.current_time();
            self.timers.run_due();
            self.warn_if_slow("timer dispatch", before);
            wait = self.timers.next_delay();
        }

        if !self.tasks.empty() {
            let before = self.clock.current_time();
            self.tasks.run();
            self.warn_if_slow("task dispatch", before);
            if !self.tasks.empty() {
                // more runnable work; poll without blocking
                wait = TimeVal::ZERO;
            }
        }

        if wait > TimeVal::from_ms(MAX_WAIT_MS) {
            wait = TimeVal::from_ms(MAX_WAIT_MS);
        }
        if self.shutdown_requested() && wait > TimeVal::from_ms(SHUTDOWN_WAIT_MS) {
            wait = TimeVal::from_ms(SHUTDOWN_WAIT_MS);
        }

        self.selector.wait_and_dispatch(wait);
    }

    fn warn_if_slow(&self, what: &str, before: TimeVal) {
        self.clock.advance_time();
        let elapsed = self.clock.current_time() - before;
        if elapsed.to_ms() > 20 {
            log::warn!("{what} ran for {}ms", elapsed.to_ms());
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}
