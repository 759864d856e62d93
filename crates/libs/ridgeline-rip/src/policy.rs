//! Policy filter seam.
//!
//! Filters are opaque to the protocol engine: integer-identified slots
//! configured with strings, consulted as a pass/transform predicate on
//! the policy tags a route carries. Re-filtering is driven by
//! `RouteDb::push_routes`.

use std::collections::BTreeMap;
use std::fmt;

use ridgeline_net::{IpNet, RouteAddress};

/// Opaque numeric tags attached to routes by policy filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTags(std::collections::BTreeSet<u32>);

impl PolicyTags {
    pub fn new() -> PolicyTags {
        PolicyTags::default()
    }

    pub fn insert(&mut self, tag: u32) {
        self.0.insert(tag);
    }

    pub fn contains(&self, tag: u32) -> bool {
        self.0.contains(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }
}

impl From<Vec<u32>> for PolicyTags {
    fn from(tags: Vec<u32>) -> PolicyTags {
        PolicyTags(tags.into_iter().collect())
    }
}

impl fmt::Display for PolicyTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tag in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{tag}")?;
            first = false;
        }
        Ok(())
    }
}

/// Transform applied to a route's tags during a re-filter pass.
pub type FilterHook<A> = Box<dyn Fn(&IpNet<A>, &PolicyTags) -> PolicyTags>;

/// The per-instance filter bank.
pub struct PolicyFilters<A: RouteAddress> {
    configs: BTreeMap<u32, String>,
    hook: Option<FilterHook<A>>,
}

impl<A: RouteAddress> Default for PolicyFilters<A> {
    fn default() -> Self {
        PolicyFilters {
            configs: BTreeMap::new(),
            hook: None,
        }
    }
}

impl<A: RouteAddress> PolicyFilters<A> {
    pub fn new() -> PolicyFilters<A> {
        PolicyFilters::default()
    }

    /// Install or replace the configuration of one filter slot.
    pub fn configure(&mut self, filter_id: u32, config: &str) {
        self.configs.insert(filter_id, config.to_string());
    }

    /// Drop the configuration of one filter slot.
    pub fn reset(&mut self, filter_id: u32) {
        self.configs.remove(&filter_id);
    }

    pub fn config(&self, filter_id: u32) -> Option<&str> {
        self.configs.get(&filter_id).map(String::as_str)
    }

    /// Install the transform consulted during re-filter passes.
    pub fn set_hook(&mut self, hook: FilterHook<A>) {
        self.hook = Some(hook);
    }

    /// Apply the configured transform; identity when none is set.
    pub fn apply(&self, net: &IpNet<A>, tags: &PolicyTags) -> PolicyTags {
        match &self.hook {
            Some(hook) => hook(net, tags),
            None => tags.clone(),
        }
    }
}
