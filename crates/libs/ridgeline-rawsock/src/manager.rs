//! The multiplexing manager: filters, sockets, and group refcounts.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use ridgeline_net::IfTree;

pub use crate::transport::Family;
use crate::transport::{RawSocketTransport, RecvMeta, SendSpec, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("receiver {0:?} has no filter on this socket")]
    NoSuchReceiver(String),

    #[error("receiver {receiver:?} has not joined {group} on {ifname}/{vifname}")]
    NotAMember {
        receiver: String,
        ifname: String,
        vifname: String,
        group: IpAddr,
    },

    #[error("no interface index known for {ifname}/{vifname}")]
    UnknownInterface { ifname: String, vifname: String },
}

/// Per-receiver predicate deciding which inbound packets it sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFilter {
    pub receiver: String,
    pub ifname: String,
    pub vifname: String,
    /// 0 matches every protocol the socket carries.
    pub protocol: u8,
    pub enable_multicast_loopback: bool,
}

impl InputFilter {
    fn wants(&self, meta: &RecvMeta, src_is_local: bool) -> bool {
        if self.ifname != meta.ifname || self.vifname != meta.vifname {
            return false;
        }
        if self.protocol != 0 && self.protocol != meta.protocol {
            return false;
        }
        if src_is_local && !self.enable_multicast_loopback {
            return false;
        }
        true
    }
}

type ReceiverCallback = Box<dyn FnMut(&RecvMeta, &[u8])>;

struct SocketState {
    fd: RawFd,
    filters: Vec<InputFilter>,
    /// `(ifname, vifname, group)` to the receivers that joined it; the
    /// kernel join exists exactly while the set is non-empty.
    groups: BTreeMap<(String, String, IpAddr), BTreeSet<String>>,
}

/// One instance multiplexes every raw socket of the process.
pub struct RawSocketManager {
    transport: Box<dyn RawSocketTransport>,
    iftree: Rc<RefCell<IfTree>>,
    sockets: BTreeMap<(Family, u8), SocketState>,
    receivers: BTreeMap<String, ReceiverCallback>,
    /// Addresses considered local for the loopback-suppression rule.
    local_addrs: BTreeSet<IpAddr>,
}

impl RawSocketManager {
    pub fn new(transport: Box<dyn RawSocketTransport>, iftree: Rc<RefCell<IfTree>>) -> Self {
        RawSocketManager {
            transport,
            iftree,
            sockets: BTreeMap::new(),
            receivers: BTreeMap::new(),
            local_addrs: BTreeSet::new(),
        }
    }

    pub fn set_local_addresses(&mut self, addrs: impl IntoIterator<Item = IpAddr>) {
        self.local_addrs = addrs.into_iter().collect();
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn socket_fd(&self, family: Family, protocol: u8) -> Option<RawFd> {
        self.sockets.get(&(family, protocol)).map(|s| s.fd)
    }

    /// Install a receiver filter; the socket for `(family, protocol)`
    /// is created on the first filter.
    pub fn register_receiver<F>(
        &mut self,
        family: Family,
        receiver: &str,
        ifname: &str,
        vifname: &str,
        protocol: u8,
        enable_multicast_loopback: bool,
        callback: F,
    ) -> Result<(), ManagerError>
    where
        F: FnMut(&RecvMeta, &[u8]) + 'static,
    {
        if !self.sockets.contains_key(&(family, protocol)) {
            let fd = self.transport.open(family, protocol)?;
            log::info!("opened raw socket for protocol {protocol} (fd {fd})");
            self.sockets.insert(
                (family, protocol),
                SocketState {
                    fd,
                    filters: Vec::new(),
                    groups: BTreeMap::new(),
                },
            );
        }
        let state = match self.sockets.get_mut(&(family, protocol)) {
            Some(state) => state,
            None => unreachable!("socket inserted above"),
        };

        let filter = InputFilter {
            receiver: receiver.to_string(),
            ifname: ifname.to_string(),
            vifname: vifname.to_string(),
            protocol,
            enable_multicast_loopback,
        };
        match state.filters.iter_mut().find(|f| {
            f.receiver == filter.receiver
                && f.ifname == filter.ifname
                && f.vifname == filter.vifname
                && f.protocol == filter.protocol
        }) {
            Some(existing) => *existing = filter,
            None => state.filters.push(filter),
        }
        self.receivers.insert(receiver.to_string(), Box::new(callback));
        Ok(())
    }

    /// Drop a receiver filter; the socket closes with its last filter.
    pub fn unregister_receiver(
        &mut self,
        family: Family,
        receiver: &str,
        ifname: &str,
        vifname: &str,
        protocol: u8,
    ) -> Result<(), ManagerError> {
        let (fd, empty_groups, socket_done) = {
            let state = self
                .sockets
                .get_mut(&(family, protocol))
                .ok_or_else(|| ManagerError::NoSuchReceiver(receiver.to_string()))?;

            let before = state.filters.len();
            state.filters.retain(|f| {
                !(f.receiver == receiver
                    && f.ifname == ifname
                    && f.vifname == vifname
                    && f.protocol == protocol)
            });
            if state.filters.len() == before {
                return Err(ManagerError::NoSuchReceiver(receiver.to_string()));
            }

            // this receiver's group memberships on the socket go with it
            let mut empty_groups = Vec::new();
            for (key, members) in state.groups.iter_mut() {
                if members.remove(receiver) && members.is_empty() {
                    empty_groups.push(key.clone());
                }
            }
            for key in &empty_groups {
                state.groups.remove(key);
            }
            (state.fd, empty_groups, state.filters.is_empty())
        };

        for key in empty_groups {
            let pif_index = self.lookup_pif_index(&key.0, &key.1).unwrap_or(0);
            if let Err(err) = self.transport.leave_group(fd, pif_index, key.2) {
                log::warn!("leaving {} failed: {err}", key.2);
            }
        }

        // other filters of the same receiver (other sockets) may remain
        let receiver_still_used = self
            .sockets
            .values()
            .any(|s| s.filters.iter().any(|f| f.receiver == receiver));
        if !receiver_still_used {
            self.receivers.remove(receiver);
        }

        if socket_done {
            self.sockets.remove(&(family, protocol));
            self.transport.close(fd);
            log::info!("closed raw socket for protocol {protocol} (fd {fd})");
        }
        Ok(())
    }

    /// Join `group`; only the first interested receiver causes a kernel
    /// join.
    pub fn join_multicast_group(
        &mut self,
        family: Family,
        receiver: &str,
        ifname: &str,
        vifname: &str,
        protocol: u8,
        group: IpAddr,
    ) -> Result<(), ManagerError> {
        let pif_index = self.lookup_pif_index(ifname, vifname)?;
        let state = self
            .sockets
            .get_mut(&(family, protocol))
            .ok_or_else(|| ManagerError::NoSuchReceiver(receiver.to_string()))?;
        if !state.filters.iter().any(|f| f.receiver == receiver) {
            return Err(ManagerError::NoSuchReceiver(receiver.to_string()));
        }

        let key = (ifname.to_string(), vifname.to_string(), group);
        let members = state.groups.entry(key.clone()).or_default();
        if members.is_empty() {
            if let Err(err) = self.transport.join_group(state.fd, pif_index, group) {
                state.groups.remove(&key);
                return Err(err.into());
            }
        }
        if let Some(members) = state.groups.get_mut(&key) {
            members.insert(receiver.to_string());
        }
        Ok(())
    }

    /// Leave `group`; only the last member causes a kernel leave.
    pub fn leave_multicast_group(
        &mut self,
        family: Family,
        receiver: &str,
        ifname: &str,
        vifname: &str,
        protocol: u8,
        group: IpAddr,
    ) -> Result<(), ManagerError> {
        let pif_index = self.lookup_pif_index(ifname, vifname)?;
        let state = self
            .sockets
            .get_mut(&(family, protocol))
            .ok_or_else(|| ManagerError::NoSuchReceiver(receiver.to_string()))?;

        let key = (ifname.to_string(), vifname.to_string(), group);
        let members = state.groups.get_mut(&key).ok_or(ManagerError::NotAMember {
            receiver: receiver.to_string(),
            ifname: ifname.to_string(),
            vifname: vifname.to_string(),
            group,
        })?;
        if !members.remove(receiver) {
            return Err(ManagerError::NotAMember {
                receiver: receiver.to_string(),
                ifname: ifname.to_string(),
                vifname: vifname.to_string(),
                group,
            });
        }
        if members.is_empty() {
            state.groups.remove(&key);
            self.transport.leave_group(state.fd, pif_index, group)?;
        }
        Ok(())
    }

    /// Emit one packet; an existing socket is reused, otherwise a
    /// transient one is opened for the call so the at-most-one-socket
    /// invariant keeps holding.
    pub fn send(&mut self, spec: &SendSpec) -> Result<(), ManagerError> {
        let family = Family::of(&spec.dst);
        if let Some(state) = self.sockets.get(&(family, spec.protocol)) {
            self.transport.send(state.fd, spec)?;
            return Ok(());
        }
        let fd = self.transport.open(family, spec.protocol)?;
        let result = self.transport.send(fd, spec);
        self.transport.close(fd);
        result.map_err(ManagerError::from)
    }

    /// A registered socket's descriptor became readable.
    pub fn handle_readable(&mut self, family: Family, protocol: u8) {
        let fd = match self.sockets.get(&(family, protocol)) {
            Some(state) => state.fd,
            None => return,
        };
        loop {
            match self.transport.recv(fd) {
                Ok(Some((mut meta, payload))) => {
                    self.resolve_interface(&mut meta);
                    self.dispatch(family, protocol, &meta, &payload);
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("receive on fd {fd} failed: {err}");
                    break;
                }
            }
        }
    }

    /// Feed one packet through the filters (also the entry point for
    /// simulated transports).
    pub fn dispatch(&mut self, family: Family, protocol: u8, meta: &RecvMeta, payload: &[u8]) {
        let matches: Vec<String> = {
            let state = match self.sockets.get(&(family, protocol)) {
                Some(state) => state,
                None => return,
            };
            let src_is_local = self.local_addrs.contains(&meta.src);
            state
                .filters
                .iter()
                .filter(|f| f.wants(meta, src_is_local))
                .map(|f| f.receiver.clone())
                .collect()
        };
        for receiver in matches {
            if let Some(callback) = self.receivers.get_mut(&receiver) {
                callback(meta, payload);
            }
        }
    }

    fn resolve_interface(&self, meta: &mut RecvMeta) {
        if meta.ifindex == 0 || !meta.ifname.is_empty() {
            return;
        }
        let tree = self.iftree.borrow();
        for (ifname, iface) in tree.interfaces() {
            for (vifname, vif) in &iface.vifs {
                if vif.pif_index == meta.ifindex {
                    meta.ifname = ifname.clone();
                    meta.vifname = vifname.clone();
                    return;
                }
            }
        }
    }

    fn lookup_pif_index(&self, ifname: &str, vifname: &str) -> Result<u32, ManagerError> {
        self.iftree
            .borrow()
            .find_vif(ifname, vifname)
            .map(|vif| vif.pif_index)
            .ok_or_else(|| ManagerError::UnknownInterface {
                ifname: ifname.to_string(),
                vifname: vifname.to_string(),
            })
    }
}
