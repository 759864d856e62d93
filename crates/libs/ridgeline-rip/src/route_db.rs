//! The RIP route database.
//!
//! Keyed by destination prefix. Every entry is owned by its origin (a
//! peer, or the local instance for redistributed routes) and carries
//! the two-phase lifecycle timers: expiry moves a live route to the
//! deletion phase at metric 16; deletion erases it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use ridgeline_event::{TimeVal, Timer, TimerList};
use ridgeline_net::{IpNet, RouteAddress};

use crate::constants::RIP_INFINITY;
use crate::policy::{FilterHook, PolicyFilters, PolicyTags};
use crate::port::PortTimerConstants;
use crate::update_queue::{RouteEvent, UpdateKind, UpdateQueue};

// ---------------------------------------------------------------------------
// Origins

struct OriginInner<A: RouteAddress> {
    port_id: Option<u32>,
    peer_addr: Option<A>,
    constants: Rc<RefCell<PortTimerConstants>>,
    routes: RefCell<Vec<Weak<RefCell<RouteEntry<A>>>>>,
}

/// Identity of the party a route was learned from.
///
/// Cloning yields another handle to the same origin; two handles
/// compare equal only when they point at the same origin record.
pub struct RouteOrigin<A: RouteAddress> {
    inner: Rc<OriginInner<A>>,
}

impl<A: RouteAddress> Clone for RouteOrigin<A> {
    fn clone(&self) -> Self {
        RouteOrigin {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<A: RouteAddress> RouteOrigin<A> {
    /// Origin for routes learned from `peer_addr` on port `port_id`.
    pub fn new_peer(
        port_id: u32,
        peer_addr: A,
        constants: Rc<RefCell<PortTimerConstants>>,
    ) -> RouteOrigin<A> {
        RouteOrigin {
            inner: Rc::new(OriginInner {
                port_id: Some(port_id),
                peer_addr: Some(peer_addr),
                constants,
                routes: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Origin for locally injected routes.
    pub fn new_local(constants: Rc<RefCell<PortTimerConstants>>) -> RouteOrigin<A> {
        RouteOrigin {
            inner: Rc::new(OriginInner {
                port_id: None,
                peer_addr: None,
                constants,
                routes: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn same_origin(&self, other: &RouteOrigin<A>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn port_id(&self) -> Option<u32> {
        self.inner.port_id
    }

    pub fn peer_addr(&self) -> Option<A> {
        self.inner.peer_addr
    }

    pub fn expiry_secs(&self) -> u32 {
        self.inner.constants.borrow().expiry_secs()
    }

    pub fn deletion_secs(&self) -> u32 {
        self.inner.constants.borrow().deletion_secs()
    }

    /// Number of live routes this origin currently owns.
    pub fn route_count(&self) -> usize {
        let mut routes = self.inner.routes.borrow_mut();
        routes.retain(|weak| weak.strong_count() > 0);
        routes.len()
    }

    pub fn dump_routes(&self) -> Vec<RouteRef<A>> {
        self.inner
            .routes
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn associate(&self, route: &RouteRef<A>) {
        self.inner.routes.borrow_mut().push(Rc::downgrade(route));
    }

    fn dissociate(&self, route: &RouteRef<A>) {
        let target = Rc::downgrade(route);
        self.inner
            .routes
            .borrow_mut()
            .retain(|weak| !Weak::ptr_eq(weak, &target));
    }
}

// ---------------------------------------------------------------------------
// Entries

/// One route known to the instance.
pub struct RouteEntry<A: RouteAddress> {
    net: IpNet<A>,
    nexthop: A,
    ifname: String,
    vifname: String,
    cost: u32,
    tag: u32,
    policy_tags: PolicyTags,
    origin: RouteOrigin<A>,
    in_deletion: bool,
    timer_deadline: TimeVal,
    // expiry while live, deletion while dying; replacing the handle
    // cancels the previous phase
    timer: Option<Timer>,
}

pub type RouteRef<A> = Rc<RefCell<RouteEntry<A>>>;

impl<A: RouteAddress> RouteEntry<A> {
    pub fn net(&self) -> IpNet<A> {
        self.net
    }

    pub fn nexthop(&self) -> A {
        self.nexthop
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn vifname(&self) -> &str {
        &self.vifname
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn policy_tags(&self) -> &PolicyTags {
        &self.policy_tags
    }

    pub fn origin(&self) -> &RouteOrigin<A> {
        &self.origin
    }

    /// True once the route has hit metric 16 and awaits erasure.
    pub fn in_deletion(&self) -> bool {
        self.in_deletion
    }

    fn snapshot(&self, kind: UpdateKind) -> RouteEvent<A> {
        RouteEvent {
            kind,
            net: self.net,
            nexthop: self.nexthop,
            cost: self.cost,
            tag: self.tag,
            origin_port: self.origin.port_id(),
            policy_tags: self.policy_tags.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// The database

struct DbInner<A: RouteAddress> {
    routes: BTreeMap<IpNet<A>, RouteRef<A>>,
}

/// Shared handle onto the route database.
pub struct RouteDb<A: RouteAddress> {
    inner: Rc<RefCell<DbInner<A>>>,
    timers: TimerList,
    update_queue: UpdateQueue<A>,
    policy: Rc<RefCell<PolicyFilters<A>>>,
}

impl<A: RouteAddress> Clone for RouteDb<A> {
    fn clone(&self) -> Self {
        RouteDb {
            inner: Rc::clone(&self.inner),
            timers: self.timers.clone(),
            update_queue: self.update_queue.clone(),
            policy: Rc::clone(&self.policy),
        }
    }
}

impl<A: RouteAddress> RouteDb<A> {
    pub fn new(timers: TimerList) -> RouteDb<A> {
        RouteDb {
            inner: Rc::new(RefCell::new(DbInner {
                routes: BTreeMap::new(),
            })),
            timers,
            update_queue: UpdateQueue::new(),
            policy: Rc::new(RefCell::new(PolicyFilters::new())),
        }
    }

    pub fn update_queue(&self) -> UpdateQueue<A> {
        self.update_queue.clone()
    }

    pub fn find_route(&self, net: &IpNet<A>) -> Option<RouteRef<A>> {
        self.inner.borrow().routes.get(net).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.inner.borrow().routes.len()
    }

    pub fn dump_routes(&self) -> Vec<RouteRef<A>> {
        self.inner.borrow().routes.values().cloned().collect()
    }

    /// Apply one advertisement (or local injection) to the database.
    ///
    /// Returns true when the database changed. `is_push` marks a policy
    /// re-filter pass: tags are rewritten in place and timers are left
    /// alone.
    #[allow(clippy::too_many_arguments)]
    pub fn update_route(
        &self,
        net: IpNet<A>,
        nexthop: A,
        ifname: &str,
        vifname: &str,
        cost: u32,
        tag: u32,
        origin: &RouteOrigin<A>,
        policy_tags: PolicyTags,
        is_push: bool,
    ) -> bool {
        if cost > RIP_INFINITY {
            log::warn!("rejecting route to {net} with metric {cost}");
            return false;
        }

        // learned routes go through the policy transform up front so a
        // later re-filter pass with no policy change is a no-op
        let policy_tags = if is_push {
            policy_tags
        } else {
            self.policy.borrow().apply(&net, &policy_tags)
        };

        let existing = self.inner.borrow().routes.get(&net).cloned();
        let mut events: Vec<RouteEvent<A>> = Vec::new();

        let changed = match existing {
            None => {
                if is_push {
                    false
                } else if cost == RIP_INFINITY {
                    // an unreachable route we never held is not worth
                    // instantiating in the deletion phase
                    false
                } else {
                    let entry = Rc::new(RefCell::new(RouteEntry {
                        net,
                        nexthop,
                        ifname: ifname.to_string(),
                        vifname: vifname.to_string(),
                        cost,
                        tag,
                        policy_tags,
                        origin: origin.clone(),
                        in_deletion: false,
                        timer_deadline: TimeVal::ZERO,
                        timer: None,
                    }));
                    origin.associate(&entry);
                    self.schedule_expiry(&entry);
                    events.push(entry.borrow().snapshot(UpdateKind::Add));
                    self.inner.borrow_mut().routes.insert(net, entry);
                    true
                }
            }
            Some(entry_ref) => {
                if is_push {
                    let mut entry = entry_ref.borrow_mut();
                    if entry.policy_tags != policy_tags {
                        entry.policy_tags = policy_tags;
                        events.push(entry.snapshot(UpdateKind::Replace));
                    }
                    true
                } else if entry_ref.borrow().origin.same_origin(origin) {
                    self.refresh_route(
                        &entry_ref,
                        nexthop,
                        ifname,
                        vifname,
                        cost,
                        tag,
                        policy_tags,
                        &mut events,
                    )
                } else {
                    self.takeover_route(
                        &entry_ref,
                        nexthop,
                        ifname,
                        vifname,
                        cost,
                        tag,
                        origin,
                        policy_tags,
                        &mut events,
                    )
                }
            }
        };

        for event in events {
            self.update_queue.push(event);
        }
        changed
    }

    /// Same-origin advertisement: refresh and possibly re-announce.
    #[allow(clippy::too_many_arguments)]
    fn refresh_route(
        &self,
        entry_ref: &RouteRef<A>,
        nexthop: A,
        ifname: &str,
        vifname: &str,
        cost: u32,
        tag: u32,
        policy_tags: PolicyTags,
        events: &mut Vec<RouteEvent<A>>,
    ) -> bool {
        if cost == RIP_INFINITY {
            let already_dying = entry_ref.borrow().in_deletion;
            if !already_dying {
                self.start_deletion(entry_ref, events);
            }
            return true;
        }

        let mut entry = entry_ref.borrow_mut();
        let changed = entry.nexthop != nexthop
            || entry.cost != cost
            || entry.tag != tag
            || entry.ifname != ifname
            || entry.vifname != vifname
            || entry.policy_tags != policy_tags
            || entry.in_deletion;
        entry.nexthop = nexthop;
        entry.cost = cost;
        entry.tag = tag;
        entry.ifname = ifname.to_string();
        entry.vifname = vifname.to_string();
        entry.policy_tags = policy_tags;
        entry.in_deletion = false;
        if changed {
            events.push(entry.snapshot(UpdateKind::Replace));
        }
        drop(entry);
        // a genuine refresh always restarts the expiry clock
        self.schedule_expiry(entry_ref);
        true
    }

    /// Different-origin advertisement: accept on better cost, or on
    /// equal cost when the incumbent is past half its lifetime.
    #[allow(clippy::too_many_arguments)]
    fn takeover_route(
        &self,
        entry_ref: &RouteRef<A>,
        nexthop: A,
        ifname: &str,
        vifname: &str,
        cost: u32,
        tag: u32,
        origin: &RouteOrigin<A>,
        policy_tags: PolicyTags,
        events: &mut Vec<RouteEvent<A>>,
    ) -> bool {
        if cost == RIP_INFINITY {
            return false;
        }
        let accept = {
            let entry = entry_ref.borrow();
            if cost < entry.cost {
                true
            } else if cost == entry.cost {
                let remaining = entry.timer_deadline - self.timers.current_time();
                let half_life = i64::from(entry.origin.expiry_secs()) * 1000 / 2;
                remaining.to_ms() <= half_life
            } else {
                false
            }
        };
        if !accept {
            return false;
        }

        let mut entry = entry_ref.borrow_mut();
        let old_origin = entry.origin.clone();
        old_origin.dissociate(entry_ref);
        entry.origin = origin.clone();
        entry.nexthop = nexthop;
        entry.cost = cost;
        entry.tag = tag;
        entry.ifname = ifname.to_string();
        entry.vifname = vifname.to_string();
        entry.policy_tags = policy_tags;
        entry.in_deletion = false;
        events.push(entry.snapshot(UpdateKind::Replace));
        drop(entry);
        origin.associate(entry_ref);
        self.schedule_expiry(entry_ref);
        true
    }

    fn schedule_expiry(&self, entry_ref: &RouteRef<A>) {
        let mut entry = entry_ref.borrow_mut();
        let expiry = TimeVal::from_secs(i64::from(entry.origin.expiry_secs()));
        entry.timer_deadline = self.timers.current_time() + expiry;
        let db = self.downgrade();
        let net = entry.net;
        entry.timer = Some(self.timers.new_oneoff_after(expiry, move || {
            if let Some(db) = db.upgrade() {
                db.expire_route(net);
            }
        }));
    }

    /// Expiry fired: poison the route and arm the deletion timer.
    fn expire_route(&self, net: IpNet<A>) {
        let entry_ref = match self.find_route(&net) {
            Some(entry_ref) => entry_ref,
            None => return,
        };
        let mut events = Vec::new();
        self.start_deletion(&entry_ref, &mut events);
        for event in events {
            self.update_queue.push(event);
        }
    }

    fn start_deletion(&self, entry_ref: &RouteRef<A>, events: &mut Vec<RouteEvent<A>>) {
        let mut entry = entry_ref.borrow_mut();
        if entry.in_deletion {
            return;
        }
        entry.cost = RIP_INFINITY;
        entry.in_deletion = true;
        let deletion = TimeVal::from_secs(i64::from(entry.origin.deletion_secs()));
        entry.timer_deadline = self.timers.current_time() + deletion;
        let db = self.downgrade();
        let net = entry.net;
        entry.timer = Some(self.timers.new_oneoff_after(deletion, move || {
            if let Some(db) = db.upgrade() {
                db.delete_route(net);
            }
        }));
        events.push(entry.snapshot(UpdateKind::Replace));
    }

    /// Deletion fired: erase the route and announce the withdrawal.
    fn delete_route(&self, net: IpNet<A>) {
        let entry_ref = match self.inner.borrow_mut().routes.remove(&net) {
            Some(entry_ref) => entry_ref,
            None => return,
        };
        let event = entry_ref.borrow().snapshot(UpdateKind::Delete);
        entry_ref.borrow().origin.dissociate(&entry_ref);
        self.update_queue.push(event);
    }

    /// Withdraw every route owned by `origin` (peer teardown).
    pub fn delete_routes_of(&self, origin: &RouteOrigin<A>) {
        let nets: Vec<IpNet<A>> = self
            .inner
            .borrow()
            .routes
            .iter()
            .filter(|(_, r)| r.borrow().origin.same_origin(origin))
            .map(|(net, _)| *net)
            .collect();
        for net in nets {
            self.delete_route(net);
        }
    }

    /// Drop everything without announcing; shutdown path.
    pub fn flush_routes(&self) {
        let mut inner = self.inner.borrow_mut();
        for (_, entry_ref) in inner.routes.iter() {
            let entry = entry_ref.borrow();
            entry.origin.dissociate(entry_ref);
        }
        inner.routes.clear();
    }

    /// Re-run the policy transform over every route; tags are updated
    /// in place and timers untouched.
    pub fn push_routes(&self) {
        let routes = self.dump_routes();
        let mut events = Vec::new();
        for entry_ref in routes {
            let (net, tags) = {
                let entry = entry_ref.borrow();
                (entry.net, entry.policy_tags.clone())
            };
            let new_tags = self.policy.borrow().apply(&net, &tags);
            if new_tags != tags {
                let mut entry = entry_ref.borrow_mut();
                entry.policy_tags = new_tags;
                events.push(entry.snapshot(UpdateKind::Replace));
            }
        }
        for event in events {
            self.update_queue.push(event);
        }
    }

    pub fn configure_filter(&self, filter_id: u32, config: &str) {
        self.policy.borrow_mut().configure(filter_id, config);
    }

    pub fn reset_filter(&self, filter_id: u32) {
        self.policy.borrow_mut().reset(filter_id);
    }

    pub fn set_policy_hook(&self, hook: FilterHook<A>) {
        self.policy.borrow_mut().set_hook(hook);
    }

    fn downgrade(&self) -> WeakRouteDb<A> {
        WeakRouteDb {
            inner: Rc::downgrade(&self.inner),
            timers: self.timers.clone(),
            update_queue: self.update_queue.clone(),
            policy: Rc::clone(&self.policy),
        }
    }
}

/// Weak handle captured by route lifecycle timers; upgrading fails once
/// the database is gone.
struct WeakRouteDb<A: RouteAddress> {
    inner: Weak<RefCell<DbInner<A>>>,
    timers: TimerList,
    update_queue: UpdateQueue<A>,
    policy: Rc<RefCell<PolicyFilters<A>>>,
}

impl<A: RouteAddress> WeakRouteDb<A> {
    fn upgrade(&self) -> Option<RouteDb<A>> {
        Some(RouteDb {
            inner: self.inner.upgrade()?,
            timers: self.timers.clone(),
            update_queue: self.update_queue.clone(),
            policy: Rc::clone(&self.policy),
        })
    }
}
