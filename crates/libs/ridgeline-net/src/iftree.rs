//! Pushed view of the system interface tree.
//!
//! The platform adaptation layer feeds interface/vif/address state into
//! an [`IfTree`]; protocol port managers subscribe for delta
//! notifications and query enabled state when binding ports.

use std::collections::BTreeMap;
use std::net::IpAddr;

/// One configured address on a vif.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfTreeAddr {
    pub addr: IpAddr,
    pub enabled: bool,
    pub prefix_len: u8,
    pub multicast_capable: bool,
}

/// A virtual interface: sub-entity of an interface carrying addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfTreeVif {
    pub enabled: bool,
    /// Platform interface index, used for multicast joins.
    pub pif_index: u32,
    pub addrs: BTreeMap<IpAddr, IfTreeAddr>,
}

impl IfTreeVif {
    pub fn find_addr(&self, addr: &IpAddr) -> Option<&IfTreeAddr> {
        self.addrs.get(addr)
    }
}

/// A physical interface and its vifs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfTreeInterface {
    pub enabled: bool,
    pub mac: Option<[u8; 6]>,
    pub mtu: u32,
    pub vifs: BTreeMap<String, IfTreeVif>,
}

impl IfTreeInterface {
    pub fn find_vif(&self, vifname: &str) -> Option<&IfTreeVif> {
        self.vifs.get(vifname)
    }
}

/// Subscriber to interface tree deltas.
pub trait IfTreeObserver {
    /// Called after a batch of updates has been applied.
    fn tree_updated(&self, tree: &IfTree);
}

/// The interface tree itself.
#[derive(Default)]
pub struct IfTree {
    interfaces: BTreeMap<String, IfTreeInterface>,
}

impl IfTree {
    pub fn new() -> IfTree {
        IfTree::default()
    }

    pub fn interfaces(&self) -> &BTreeMap<String, IfTreeInterface> {
        &self.interfaces
    }

    pub fn find_interface(&self, ifname: &str) -> Option<&IfTreeInterface> {
        self.interfaces.get(ifname)
    }

    pub fn find_vif(&self, ifname: &str, vifname: &str) -> Option<&IfTreeVif> {
        self.find_interface(ifname)?.find_vif(vifname)
    }

    pub fn find_address(&self, ifname: &str, vifname: &str, addr: &IpAddr) -> Option<&IfTreeAddr> {
        self.find_vif(ifname, vifname)?.find_addr(addr)
    }

    /// An address counts as enabled only when the whole path to it is.
    pub fn address_enabled(&self, ifname: &str, vifname: &str, addr: &IpAddr) -> bool {
        let iface = match self.find_interface(ifname) {
            Some(iface) if iface.enabled => iface,
            _ => return false,
        };
        let vif = match iface.find_vif(vifname) {
            Some(vif) if vif.enabled => vif,
            _ => return false,
        };
        vif.find_addr(addr).map(|a| a.enabled).unwrap_or(false)
    }

    pub fn set_interface(&mut self, ifname: &str, iface: IfTreeInterface) {
        self.interfaces.insert(ifname.to_string(), iface);
    }

    pub fn remove_interface(&mut self, ifname: &str) {
        self.interfaces.remove(ifname);
    }

    pub fn set_vif(&mut self, ifname: &str, vifname: &str, vif: IfTreeVif) {
        self.interfaces
            .entry(ifname.to_string())
            .or_default()
            .vifs
            .insert(vifname.to_string(), vif);
    }

    pub fn set_address(&mut self, ifname: &str, vifname: &str, addr: IfTreeAddr) {
        let vif = self
            .interfaces
            .entry(ifname.to_string())
            .or_default()
            .vifs
            .entry(vifname.to_string())
            .or_default();
        vif.addrs.insert(addr.addr, addr);
    }

    pub fn remove_address(&mut self, ifname: &str, vifname: &str, addr: &IpAddr) {
        if let Some(vif) = self
            .interfaces
            .get_mut(ifname)
            .and_then(|iface| iface.vifs.get_mut(vifname))
        {
            vif.addrs.remove(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(a: [u8; 4]) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(a))
    }

    fn sample_tree() -> IfTree {
        let mut tree = IfTree::new();
        tree.set_interface(
            "eth0",
            IfTreeInterface {
                enabled: true,
                mac: Some([0, 1, 2, 3, 4, 5]),
                mtu: 1500,
                vifs: BTreeMap::new(),
            },
        );
        tree.set_vif(
            "eth0",
            "eth0",
            IfTreeVif {
                enabled: true,
                pif_index: 2,
                addrs: BTreeMap::new(),
            },
        );
        tree.set_address(
            "eth0",
            "eth0",
            IfTreeAddr {
                addr: addr([10, 0, 0, 1]),
                enabled: true,
                prefix_len: 24,
                multicast_capable: true,
            },
        );
        tree
    }

    #[test]
    fn lookup_path() {
        let tree = sample_tree();
        assert!(tree.find_interface("eth0").is_some());
        assert!(tree.find_vif("eth0", "eth0").is_some());
        assert!(tree
            .find_address("eth0", "eth0", &addr([10, 0, 0, 1]))
            .is_some());
        assert!(tree.find_address("eth0", "eth0", &addr([10, 0, 0, 2])).is_none());
    }

    #[test]
    fn enabled_requires_whole_path() {
        let mut tree = sample_tree();
        assert!(tree.address_enabled("eth0", "eth0", &addr([10, 0, 0, 1])));

        // disabling the interface cuts off the address below it
        let mut iface = tree.find_interface("eth0").cloned().expect("iface");
        iface.enabled = false;
        tree.set_interface("eth0", iface);
        assert!(!tree.address_enabled("eth0", "eth0", &addr([10, 0, 0, 1])));
    }

    #[test]
    fn remove_address() {
        let mut tree = sample_tree();
        tree.remove_address("eth0", "eth0", &addr([10, 0, 0, 1]));
        assert!(tree
            .find_address("eth0", "eth0", &addr([10, 0, 0, 1]))
            .is_none());
    }
}
