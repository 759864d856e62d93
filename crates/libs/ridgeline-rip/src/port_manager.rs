//! Binding of ports to `(interface, vif, address)` tuples.
//!
//! The manager watches the interface feed for enable/disable deltas,
//! creates the I/O binding for each configured RIP address, dispatches
//! inbound packets to the owning port by socket identity, and parks
//! removed ports in a dead set until their I/O teardown completes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use ridgeline_event::TimerList;
use ridgeline_net::{IfTree, ServiceStatus};

use crate::port::Port;
use crate::port_io::PortIo;
use crate::route_db::RouteDb;

#[derive(Debug, thiserror::Error)]
pub enum PortManagerError {
    #[error("address {addr} is not configured on {ifname}/{vifname}")]
    AddressUnknown {
        ifname: String,
        vifname: String,
        addr: Ipv4Addr,
    },

    #[error("creating I/O binding failed: {0}")]
    IoCreateFailed(String),
}

/// Produces the transport binding for a new port.
pub trait PortIoFactory {
    fn create(
        &mut self,
        ifname: &str,
        vifname: &str,
        addr: Ipv4Addr,
    ) -> Result<Box<dyn PortIo<Ipv4Addr>>, String>;
}

struct PmInner {
    timers: TimerList,
    route_db: RouteDb<Ipv4Addr>,
    iftree: Rc<RefCell<IfTree>>,
    io_factory: Box<dyn PortIoFactory>,
    ports: Vec<Rc<RefCell<Port>>>,
    /// Ports awaiting asynchronous I/O teardown, keyed by socket id.
    dead_ports: BTreeMap<u32, Rc<RefCell<Port>>>,
    next_port_id: u32,
}

/// Shared handle onto the port manager.
pub struct PortManager {
    inner: Rc<RefCell<PmInner>>,
}

impl Clone for PortManager {
    fn clone(&self) -> Self {
        PortManager {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PortManager {
    pub fn new(
        timers: TimerList,
        route_db: RouteDb<Ipv4Addr>,
        iftree: Rc<RefCell<IfTree>>,
        io_factory: Box<dyn PortIoFactory>,
    ) -> PortManager {
        PortManager {
            inner: Rc::new(RefCell::new(PmInner {
                timers,
                route_db,
                iftree,
                io_factory,
                ports: Vec::new(),
                dead_ports: BTreeMap::new(),
                next_port_id: 1,
            })),
        }
    }

    /// Create a port on `(ifname, vifname, addr)`. Idempotent: an
    /// existing binding is left untouched.
    pub fn add_rip_address(
        &self,
        ifname: &str,
        vifname: &str,
        addr: Ipv4Addr,
    ) -> Result<Rc<RefCell<Port>>, PortManagerError> {
        if let Some(port) = self.find_port(ifname, vifname, addr) {
            return Ok(port);
        }

        let mut inner = self.inner.borrow_mut();
        if inner
            .iftree
            .borrow()
            .find_address(ifname, vifname, &IpAddr::V4(addr))
            .is_none()
        {
            return Err(PortManagerError::AddressUnknown {
                ifname: ifname.to_string(),
                vifname: vifname.to_string(),
                addr,
            });
        }
        let enabled = inner
            .iftree
            .borrow()
            .address_enabled(ifname, vifname, &IpAddr::V4(addr));

        let io = inner
            .io_factory
            .create(ifname, vifname, addr)
            .map_err(PortManagerError::IoCreateFailed)?;

        let id = inner.next_port_id;
        inner.next_port_id += 1;
        let port = Port::new(id, io, inner.timers.clone(), inner.route_db.clone());
        port.borrow_mut().set_enabled(enabled);
        log::info!("created RIP port {id} on {ifname}/{vifname}/{addr} (enabled: {enabled})");
        inner.ports.push(Rc::clone(&port));
        Ok(port)
    }

    /// Tear a port down: withdraw its routes and park it until the I/O
    /// binding reports shutdown.
    pub fn remove_rip_address(&self, ifname: &str, vifname: &str, addr: Ipv4Addr) -> bool {
        let port = match self.find_port(ifname, vifname, addr) {
            Some(port) => port,
            None => return false,
        };
        let mut inner = self.inner.borrow_mut();
        inner.ports.retain(|p| !Rc::ptr_eq(p, &port));

        let socket_id = {
            let mut p = port.borrow_mut();
            p.shutdown();
            p.io_mut().request_shutdown();
            p.io().socket_id()
        };
        if port.borrow().io().status() == ServiceStatus::Shutdown {
            log::info!("RIP port on {ifname}/{vifname}/{addr} shut down");
        } else {
            inner.dead_ports.insert(socket_id, port);
        }
        true
    }

    /// An I/O binding finished its asynchronous teardown.
    pub fn io_shutdown_complete(&self, socket_id: u32) {
        if self.inner.borrow_mut().dead_ports.remove(&socket_id).is_some() {
            log::info!("I/O binding {socket_id} finished shutting down");
        }
    }

    /// Feed an inbound packet to the port owning `socket_id`.
    pub fn deliver_packet(
        &self,
        socket_id: u32,
        ifname: &str,
        vifname: &str,
        src: Ipv4Addr,
        src_port: u16,
        packet: &[u8],
    ) {
        let port = {
            let inner = self.inner.borrow();
            inner
                .ports
                .iter()
                .find(|p| p.borrow().io().socket_id() == socket_id)
                .cloned()
        };
        let port = match port {
            Some(port) => port,
            None => {
                log::warn!("packet for unknown socket id {socket_id}; dropped");
                return;
            }
        };
        {
            let p = port.borrow();
            if p.io().ifname() != ifname || p.io().vifname() != vifname {
                log::warn!(
                    "packet for socket id {socket_id} names {ifname}/{vifname}, \
                     expected {}/{}; dropped",
                    p.io().ifname(),
                    p.io().vifname()
                );
                return;
            }
        }
        port.borrow_mut().port_io_receive(src, src_port, packet);
    }

    pub fn find_port(
        &self,
        ifname: &str,
        vifname: &str,
        addr: Ipv4Addr,
    ) -> Option<Rc<RefCell<Port>>> {
        self.inner
            .borrow()
            .ports
            .iter()
            .find(|p| {
                let p = p.borrow();
                p.io().ifname() == ifname
                    && p.io().vifname() == vifname
                    && p.io().address() == addr
            })
            .cloned()
    }

    pub fn rip_address_exists(&self, ifname: &str, vifname: &str, addr: Ipv4Addr) -> bool {
        self.find_port(ifname, vifname, addr).is_some()
    }

    pub fn rip_address_up(&self, ifname: &str, vifname: &str, addr: Ipv4Addr) -> bool {
        self.find_port(ifname, vifname, addr)
            .map(|p| p.borrow().enabled())
            .unwrap_or(false)
    }

    pub fn port_count(&self) -> usize {
        self.inner.borrow().ports.len()
    }

    pub fn dead_port_count(&self) -> usize {
        self.inner.borrow().dead_ports.len()
    }

    /// React to a batch of interface feed deltas: ports follow the
    /// enabled state of their address path.
    pub fn tree_updated(&self) {
        let ports: Vec<Rc<RefCell<Port>>> = self.inner.borrow().ports.clone();
        let iftree = Rc::clone(&self.inner.borrow().iftree);
        for port in ports {
            let (ifname, vifname, addr) = {
                let p = port.borrow();
                (
                    p.io().ifname().to_string(),
                    p.io().vifname().to_string(),
                    p.io().address(),
                )
            };
            let enabled = iftree
                .borrow()
                .address_enabled(&ifname, &vifname, &IpAddr::V4(addr));
            let mut p = port.borrow_mut();
            if p.enabled() != enabled {
                log::info!("RIP port on {ifname}/{vifname}/{addr} now enabled: {enabled}");
                p.set_enabled(enabled);
            }
        }
    }
}
