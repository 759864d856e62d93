//! Prioritized cooperative background tasks.
//!
//! Tasks run after timers within a loop iteration. Priorities are strict
//! (lower number first); within a priority band tasks share the band in
//! weighted round-robin fashion, a task with weight `w` receiving `w`
//! consecutive turns per rotation.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

pub const PRIORITY_HIGHEST: i32 = 0;
pub const PRIORITY_DEFAULT: i32 = 4;
pub const PRIORITY_BACKGROUND: i32 = 7;
pub const PRIORITY_LOWEST: i32 = 9;
pub const PRIORITY_INFINITY: i32 = 255;

pub const WEIGHT_DEFAULT: u32 = 1;

struct TaskEntry {
    scheduled: bool,
    repeated: bool,
    weight: u32,
    credit: u32,
    // taken out for the duration of a dispatch
    callback: Option<Box<dyn FnMut() -> bool>>,
}

/// Handle to a scheduled task; dropping it unschedules the task.
pub struct Task {
    entry: Rc<RefCell<TaskEntry>>,
}

impl Task {
    pub fn scheduled(&self) -> bool {
        self.entry.borrow().scheduled
    }

    pub fn unschedule(&self) {
        self.entry.borrow_mut().scheduled = false;
    }
}

#[derive(Default)]
struct Band {
    queue: VecDeque<Weak<RefCell<TaskEntry>>>,
}

/// Priority-banded runnable queue.
pub struct TaskList {
    bands: Rc<RefCell<BTreeMap<i32, Band>>>,
}

impl Clone for TaskList {
    fn clone(&self) -> Self {
        TaskList {
            bands: Rc::clone(&self.bands),
        }
    }
}

impl Default for TaskList {
    fn default() -> Self {
        TaskList::new()
    }
}

impl TaskList {
    pub fn new() -> TaskList {
        TaskList {
            bands: Rc::new(RefCell::new(BTreeMap::new())),
        }
    }

    /// Schedule a task that runs once.
    pub fn new_oneoff_task<F>(&self, mut cb: F, priority: i32, weight: u32) -> Task
    where
        F: FnMut() + 'static,
    {
        self.schedule(
            Box::new(move || {
                cb();
                false
            }),
            priority,
            weight,
            false,
        )
    }

    /// Schedule a task that runs until its callback returns false.
    pub fn new_repeated_task<F>(&self, cb: F, priority: i32, weight: u32) -> Task
    where
        F: FnMut() -> bool + 'static,
    {
        self.schedule(Box::new(cb), priority, weight, true)
    }

    fn schedule(
        &self,
        cb: Box<dyn FnMut() -> bool>,
        priority: i32,
        weight: u32,
        repeated: bool,
    ) -> Task {
        let weight = weight.max(1);
        let entry = Rc::new(RefCell::new(TaskEntry {
            scheduled: true,
            repeated,
            weight,
            credit: weight,
            callback: Some(cb),
        }));
        self.bands
            .borrow_mut()
            .entry(priority)
            .or_default()
            .queue
            .push_back(Rc::downgrade(&entry));
        Task { entry }
    }

    pub fn empty(&self) -> bool {
        let bands = self.bands.borrow();
        !bands.iter().any(|(_, band)| {
            band.queue.iter().any(|weak| {
                weak.upgrade()
                    .map(|e| e.borrow().scheduled)
                    .unwrap_or(false)
            })
        })
    }

    /// Run the single highest-priority runnable task.
    ///
    /// Returns true when a task ran.
    pub fn run(&self) -> bool {
        loop {
            // pick the next live entry from the best band
            let picked = {
                let mut bands = self.bands.borrow_mut();
                let mut picked = None;
                let mut empty_bands = Vec::new();
                for (prio, band) in bands.iter_mut() {
                    while let Some(weak) = band.queue.pop_front() {
                        match weak.upgrade() {
                            Some(entry) if entry.borrow().scheduled => {
                                picked = Some((*prio, weak, entry));
                                break;
                            }
                            _ => continue, // dead or cancelled; discard
                        }
                    }
                    if picked.is_some() {
                        break;
                    }
                    if band.queue.is_empty() {
                        empty_bands.push(*prio);
                    }
                }
                for prio in empty_bands {
                    bands.remove(&prio);
                }
                picked
            };

            let (prio, weak, entry) = match picked {
                Some(p) => p,
                None => return false,
            };

            let cb = entry.borrow_mut().callback.take();
            let mut cb = match cb {
                Some(cb) => cb,
                None => continue, // re-entrant dispatch of the same entry
            };
            let keep = cb();

            let mut e = entry.borrow_mut();
            e.callback = Some(cb);
            let repeated = e.repeated;
            let still_scheduled = e.scheduled && keep && repeated;
            e.scheduled = still_scheduled;
            if still_scheduled {
                let front = if e.credit > 1 {
                    e.credit -= 1;
                    true
                } else {
                    e.credit = e.weight;
                    false
                };
                drop(e);
                let mut bands = self.bands.borrow_mut();
                let band = bands.entry(prio).or_default();
                if front {
                    band.queue.push_front(weak);
                } else {
                    band.queue.push_back(weak);
                }
            }
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn oneoff_runs_once() {
        let list = TaskList::new();
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let _t = list.new_oneoff_task(move || h.set(h.get() + 1), PRIORITY_DEFAULT, 1);
        assert!(list.run());
        assert!(!list.run());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn strict_priority_order() {
        let list = TaskList::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let _low = list.new_oneoff_task(move || o1.borrow_mut().push("low"), PRIORITY_LOWEST, 1);
        let _high = list.new_oneoff_task(move || o2.borrow_mut().push("high"), PRIORITY_HIGHEST, 1);
        while list.run() {}
        assert_eq!(*order.borrow(), vec!["high", "low"]);
    }

    #[test]
    fn weights_share_band() {
        let list = TaskList::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let heavy = list.new_repeated_task(
            move || {
                o1.borrow_mut().push('a');
                true
            },
            PRIORITY_DEFAULT,
            2,
        );
        let light = list.new_repeated_task(
            move || {
                o2.borrow_mut().push('b');
                true
            },
            PRIORITY_DEFAULT,
            1,
        );
        for _ in 0..6 {
            list.run();
        }
        heavy.unschedule();
        light.unschedule();
        // weight 2 task runs twice per rotation
        assert_eq!(order.borrow().iter().collect::<String>(), "aabaab");
    }

    #[test]
    fn repeated_stops_on_false() {
        let list = TaskList::new();
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let _t = list.new_repeated_task(
            move || {
                h.set(h.get() + 1);
                h.get() < 2
            },
            PRIORITY_DEFAULT,
            1,
        );
        while list.run() {}
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn dropping_handle_unschedules() {
        let list = TaskList::new();
        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let t = list.new_oneoff_task(move || h.set(h.get() + 1), PRIORITY_DEFAULT, 1);
        drop(t);
        assert!(!list.run());
        assert_eq!(hits.get(), 0);
    }
}
