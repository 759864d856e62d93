//! Top-level container for one RIP instance.

use std::net::Ipv4Addr;

use ridgeline_event::TimerList;

use crate::route_db::RouteDb;

/// One RIP instance: the timer list it schedules on, its route
/// database, and through the database the update queue and policy
/// filter bank every port shares.
pub struct RipSystem {
    timers: TimerList,
    route_db: RouteDb<Ipv4Addr>,
}

impl RipSystem {
    pub fn new(timers: TimerList) -> RipSystem {
        let route_db = RouteDb::new(timers.clone());
        RipSystem { timers, route_db }
    }

    pub fn timers(&self) -> TimerList {
        self.timers.clone()
    }

    pub fn route_db(&self) -> RouteDb<Ipv4Addr> {
        self.route_db.clone()
    }

    pub fn configure_filter(&self, filter_id: u32, config: &str) {
        self.route_db.configure_filter(filter_id, config);
    }

    pub fn reset_filter(&self, filter_id: u32) {
        self.route_db.reset_filter(filter_id);
    }

    /// Re-run policy over the whole table.
    pub fn push_routes(&self) {
        self.route_db.push_routes();
    }
}

impl Drop for RipSystem {
    fn drop(&mut self) {
        self.route_db.flush_routes();
    }
}
