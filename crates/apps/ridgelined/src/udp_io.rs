//! UDP transport binding for RIP ports.
//!
//! Each port gets its own socket bound to the RIP port with the RIPv2
//! group joined on the port's interface. Inbound datagrams are read
//! from a selector callback and handed to the port manager keyed by
//! socket identity.

use std::cell::RefCell;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Protocol, Socket, Type};

use ridgeline_event::{IoEventType, SelectorList, PRIORITY_DEFAULT};
use ridgeline_net::ServiceStatus;
use rip_core::constants::{RIP_PORT, RIP_V2_GROUP};
use rip_core::{PortIo, PortIoFactory, PortManager};

/// Late-bound handle to the port manager; the factory is constructed
/// before the manager that owns it.
pub type PortManagerSlot = Rc<RefCell<Option<PortManager>>>;

pub struct UdpPortIoFactory {
    selector: SelectorList,
    port_manager: PortManagerSlot,
    next_socket_id: u32,
}

impl UdpPortIoFactory {
    pub fn new(selector: SelectorList, port_manager: PortManagerSlot) -> UdpPortIoFactory {
        UdpPortIoFactory {
            selector,
            port_manager,
            next_socket_id: 1,
        }
    }
}

impl PortIoFactory for UdpPortIoFactory {
    fn create(
        &mut self,
        ifname: &str,
        vifname: &str,
        addr: Ipv4Addr,
    ) -> Result<Box<dyn PortIo<Ipv4Addr>>, String> {
        let socket_id = self.next_socket_id;
        self.next_socket_id += 1;
        let io = UdpPortIo::open(
            self.selector.clone(),
            Rc::clone(&self.port_manager),
            ifname,
            vifname,
            addr,
            socket_id,
        )
        .map_err(|e| e.to_string())?;
        Ok(Box::new(io))
    }
}

pub struct UdpPortIo {
    fd: RawFd,
    selector: SelectorList,
    ifname: String,
    vifname: String,
    addr: Ipv4Addr,
    socket_id: u32,
    status: ServiceStatus,
}

impl UdpPortIo {
    fn open(
        selector: SelectorList,
        port_manager: PortManagerSlot,
        ifname: &str,
        vifname: &str,
        addr: Ipv4Addr,
        socket_id: u32,
    ) -> std::io::Result<UdpPortIo> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, RIP_PORT).into())?;
        socket.join_multicast_v4(&RIP_V2_GROUP, &addr)?;
        socket.set_multicast_if_v4(&addr)?;
        // RIPv2 responses must not leave the link
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(false)?;
        let fd = socket.into_raw_fd();

        let cb_ifname = ifname.to_string();
        let cb_vifname = vifname.to_string();
        selector.add_ioevent_cb(
            fd,
            IoEventType::Read,
            move |fd, _| {
                drain_socket(fd, socket_id, &cb_ifname, &cb_vifname, &port_manager);
            },
            PRIORITY_DEFAULT,
        );

        log::info!("RIP I/O bound to {ifname}/{vifname}/{addr} (socket id {socket_id})");
        Ok(UdpPortIo {
            fd,
            selector,
            ifname: ifname.to_string(),
            vifname: vifname.to_string(),
            addr,
            socket_id,
            status: ServiceStatus::Running,
        })
    }

    fn teardown(&mut self) {
        if self.status == ServiceStatus::Shutdown {
            return;
        }
        self.selector.remove_ioevent_cb(self.fd, IoEventType::Any);
        unsafe { libc::close(self.fd) };
        self.status = ServiceStatus::Shutdown;
    }
}

fn drain_socket(
    fd: RawFd,
    socket_id: u32,
    ifname: &str,
    vifname: &str,
    port_manager: &PortManagerSlot,
) {
    let mut buf = [0u8; 4096];
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut addr_len,
            )
        };
        if n <= 0 {
            break;
        }
        if storage.ss_family != libc::AF_INET as libc::sa_family_t {
            continue;
        }
        let sin: &libc::sockaddr_in =
            unsafe { &*(&storage as *const libc::sockaddr_storage).cast() };
        let src = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        let src_port = u16::from_be(sin.sin_port);

        if let Some(pm) = port_manager.borrow().as_ref() {
            pm.deliver_packet(socket_id, ifname, vifname, src, src_port, &buf[..n as usize]);
        }
    }
}

impl PortIo<Ipv4Addr> for UdpPortIo {
    fn send(&mut self, dst: &Ipv4Addr, dst_port: u16, payload: &[u8]) -> bool {
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: dst_port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*dst).to_be(),
            },
            sin_zero: [0; 8],
        };
        let n = unsafe {
            libc::sendto(
                self.fd,
                payload.as_ptr().cast(),
                payload.len(),
                0,
                (&sin as *const libc::sockaddr_in).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if n < 0 {
            log::warn!(
                "send to {dst}:{dst_port} on {}/{} failed: {}",
                self.ifname,
                self.vifname,
                std::io::Error::last_os_error()
            );
            return false;
        }
        n as usize == payload.len()
    }

    fn enabled(&self) -> bool {
        self.status == ServiceStatus::Running
    }

    fn ifname(&self) -> &str {
        &self.ifname
    }

    fn vifname(&self) -> &str {
        &self.vifname
    }

    fn address(&self) -> Ipv4Addr {
        self.addr
    }

    fn socket_id(&self) -> u32 {
        self.socket_id
    }

    fn request_shutdown(&mut self) {
        self.teardown();
    }

    fn status(&self) -> ServiceStatus {
        self.status
    }
}

impl Drop for UdpPortIo {
    fn drop(&mut self) {
        self.teardown();
    }
}
