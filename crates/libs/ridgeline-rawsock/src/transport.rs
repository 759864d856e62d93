//! Kernel-facing socket operations behind a trait, so the manager can
//! be exercised without privileges.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Address family of a raw socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Family {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket creation failed: {0}")]
    SocketCreateFailed(String),

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("multicast group membership change failed: {0}")]
    JoinGroupFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("bad descriptor {0}")]
    BadDescriptor(RawFd),
}

/// Metadata accompanying one received IP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvMeta {
    /// Platform interface index the packet arrived on; 0 when unknown.
    pub ifindex: u32,
    /// Interface/vif names, resolved by the manager from `ifindex`.
    pub ifname: String,
    pub vifname: String,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub ttl: i32,
    pub tos: i32,
    pub router_alert: bool,
    pub internet_control: bool,
    pub ext_headers_type: Vec<u8>,
    pub ext_headers_payload: Vec<Vec<u8>>,
}

/// Everything needed to emit one IP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSpec {
    pub ifname: String,
    pub vifname: String,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub ttl: i32,
    pub tos: i32,
    pub router_alert: bool,
    pub internet_control: bool,
    pub ext_headers_type: Vec<u8>,
    pub ext_headers_payload: Vec<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// The kernel operations the manager needs.
pub trait RawSocketTransport {
    fn open(&mut self, family: Family, protocol: u8) -> Result<RawFd, TransportError>;

    fn close(&mut self, fd: RawFd);

    fn join_group(
        &mut self,
        fd: RawFd,
        pif_index: u32,
        group: IpAddr,
    ) -> Result<(), TransportError>;

    fn leave_group(
        &mut self,
        fd: RawFd,
        pif_index: u32,
        group: IpAddr,
    ) -> Result<(), TransportError>;

    fn send(&mut self, fd: RawFd, spec: &SendSpec) -> Result<(), TransportError>;

    /// Non-blocking read of one packet; `Ok(None)` when nothing is
    /// queued.
    fn recv(&mut self, fd: RawFd) -> Result<Option<(RecvMeta, Vec<u8>)>, TransportError>;
}

// ---------------------------------------------------------------------------
// Real sockets

/// Transport over real raw sockets.
#[derive(Debug, Default)]
pub struct SystemTransport;

impl SystemTransport {
    pub fn new() -> SystemTransport {
        SystemTransport
    }

    /// Run `f` against a borrowed view of the raw descriptor.
    fn with_sock<R>(fd: RawFd, f: impl FnOnce(socket2::SockRef<'_>) -> R) -> R {
        // the manager owns fd for the duration of the call
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        f(socket2::SockRef::from(&borrowed))
    }
}

impl RawSocketTransport for SystemTransport {
    fn open(&mut self, family: Family, protocol: u8) -> Result<RawFd, TransportError> {
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(i32::from(protocol))))
            .map_err(|e| TransportError::SocketCreateFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::SocketCreateFailed(e.to_string()))?;
        if family == Family::V4 {
            // receive the interface index with each packet
            let fd = std::os::unix::io::AsRawFd::as_raw_fd(&socket);
            let on: libc::c_int = 1;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    libc::IP_PKTINFO,
                    (&on as *const libc::c_int).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                log::warn!("IP_PKTINFO unavailable; inbound interface resolution degraded");
            }
        }
        Ok(std::os::unix::io::IntoRawFd::into_raw_fd(socket))
    }

    fn close(&mut self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn join_group(
        &mut self,
        fd: RawFd,
        pif_index: u32,
        group: IpAddr,
    ) -> Result<(), TransportError> {
        match group {
            IpAddr::V4(group) => {
                let mreqn = libc::ip_mreqn {
                    imr_multiaddr: libc::in_addr {
                        s_addr: u32::from(group).to_be(),
                    },
                    imr_address: libc::in_addr { s_addr: 0 },
                    imr_ifindex: pif_index as libc::c_int,
                };
                let rc = unsafe {
                    libc::setsockopt(
                        fd,
                        libc::IPPROTO_IP,
                        libc::IP_ADD_MEMBERSHIP,
                        (&mreqn as *const libc::ip_mreqn).cast(),
                        std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
                    )
                };
                if rc != 0 {
                    return Err(TransportError::JoinGroupFailed(
                        std::io::Error::last_os_error().to_string(),
                    ));
                }
                Ok(())
            }
            IpAddr::V6(group) => Self::with_sock(fd, |sock| {
                sock.join_multicast_v6(&group, pif_index)
                    .map_err(|e| TransportError::JoinGroupFailed(e.to_string()))
            }),
        }
    }

    fn leave_group(
        &mut self,
        fd: RawFd,
        pif_index: u32,
        group: IpAddr,
    ) -> Result<(), TransportError> {
        match group {
            IpAddr::V4(group) => {
                let mreqn = libc::ip_mreqn {
                    imr_multiaddr: libc::in_addr {
                        s_addr: u32::from(group).to_be(),
                    },
                    imr_address: libc::in_addr { s_addr: 0 },
                    imr_ifindex: pif_index as libc::c_int,
                };
                let rc = unsafe {
                    libc::setsockopt(
                        fd,
                        libc::IPPROTO_IP,
                        libc::IP_DROP_MEMBERSHIP,
                        (&mreqn as *const libc::ip_mreqn).cast(),
                        std::mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
                    )
                };
                if rc != 0 {
                    return Err(TransportError::JoinGroupFailed(
                        std::io::Error::last_os_error().to_string(),
                    ));
                }
                Ok(())
            }
            IpAddr::V6(group) => Self::with_sock(fd, |sock| {
                sock.leave_multicast_v6(&group, pif_index)
                    .map_err(|e| TransportError::JoinGroupFailed(e.to_string()))
            }),
        }
    }

    fn send(&mut self, fd: RawFd, spec: &SendSpec) -> Result<(), TransportError> {
        Self::with_sock(fd, |sock| {
            if spec.ttl >= 0 {
                let result = match spec.dst {
                    IpAddr::V4(dst) if dst.is_multicast() => {
                        sock.set_multicast_ttl_v4(spec.ttl as u32)
                    }
                    IpAddr::V4(_) => sock.set_ttl(spec.ttl as u32),
                    IpAddr::V6(_) => sock.set_unicast_hops_v6(spec.ttl as u32),
                };
                if let Err(e) = result {
                    return Err(TransportError::SendFailed(e.to_string()));
                }
            }
            if spec.tos >= 0 {
                if let IpAddr::V4(_) = spec.dst {
                    if let Err(e) = sock.set_tos(spec.tos as u32) {
                        return Err(TransportError::SendFailed(e.to_string()));
                    }
                }
            }
            if spec.router_alert {
                if let IpAddr::V4(_) = spec.dst {
                    // RFC 2113 router alert, value zero
                    let option: [u8; 4] = [0x94, 0x04, 0x00, 0x00];
                    let rc = unsafe {
                        libc::setsockopt(
                            fd,
                            libc::IPPROTO_IP,
                            libc::IP_OPTIONS,
                            option.as_ptr().cast(),
                            option.len() as libc::socklen_t,
                        )
                    };
                    if rc != 0 {
                        return Err(TransportError::SendFailed(
                            std::io::Error::last_os_error().to_string(),
                        ));
                    }
                }
            }
            if !spec.ext_headers_type.is_empty() {
                log::warn!("extension headers are not emitted by this transport");
            }

            let dst = SockAddr::from(SocketAddr::new(spec.dst, 0));
            sock.send_to(&spec.payload, &dst)
                .map(|_| ())
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
    }

    fn recv(&mut self, fd: RawFd) -> Result<Option<(RecvMeta, Vec<u8>)>, TransportError> {
        let mut buf = [0u8; 65536];
        let mut cmsg = [0u8; 128];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg.as_mut_ptr().cast();
        msg.msg_controllen = cmsg.len();

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                Some(libc::EBADF) => Err(TransportError::BadDescriptor(fd)),
                _ => Err(TransportError::SendFailed(err.to_string())),
            };
        }
        let n = n as usize;

        // pull the arrival interface out of the ancillary data
        let mut ifindex = 0u32;
        unsafe {
            let mut cursor = libc::CMSG_FIRSTHDR(&msg);
            while !cursor.is_null() {
                let hdr = &*cursor;
                if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                    let info = &*(libc::CMSG_DATA(cursor) as *const libc::in_pktinfo);
                    ifindex = info.ipi_ifindex as u32;
                }
                cursor = libc::CMSG_NXTHDR(&msg, cursor);
            }
        }

        // a v4 raw socket hands us the IP header; parse what the
        // receivers need
        if n < 20 {
            return Ok(None);
        }
        let ihl = usize::from(buf[0] & 0x0f) * 4;
        if buf[0] >> 4 != 4 || n < ihl {
            return Ok(None);
        }
        let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
        let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
        let meta = RecvMeta {
            ifindex,
            ifname: String::new(),
            vifname: String::new(),
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            protocol: buf[9],
            ttl: i32::from(buf[8]),
            tos: i32::from(buf[1]),
            router_alert: ihl > 20 && buf[20..ihl].contains(&0x94),
            internet_control: false,
            ext_headers_type: Vec::new(),
            ext_headers_payload: Vec::new(),
        };
        Ok(Some((meta, buf[ihl..n].to_vec())))
    }
}

// ---------------------------------------------------------------------------
// Recording transport

/// A call recorded by [`DummyTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Open { family: Family, protocol: u8 },
    Close { fd: RawFd },
    Join { fd: RawFd, pif_index: u32, group: IpAddr },
    Leave { fd: RawFd, pif_index: u32, group: IpAddr },
    Send { fd: RawFd, spec: SendSpec },
}

/// In-memory transport that records every kernel call; the test and
/// simulation twin of [`SystemTransport`].
#[derive(Default)]
pub struct DummyTransport {
    next_fd: RawFd,
    log: Rc<RefCell<Vec<TransportOp>>>,
    open_fds: BTreeMap<RawFd, (Family, u8)>,
}

impl DummyTransport {
    pub fn new() -> DummyTransport {
        DummyTransport {
            next_fd: 1000,
            log: Rc::new(RefCell::new(Vec::new())),
            open_fds: BTreeMap::new(),
        }
    }

    pub fn log_handle(&self) -> Rc<RefCell<Vec<TransportOp>>> {
        Rc::clone(&self.log)
    }

    pub fn open_count(&self) -> usize {
        self.open_fds.len()
    }
}

impl RawSocketTransport for DummyTransport {
    fn open(&mut self, family: Family, protocol: u8) -> Result<RawFd, TransportError> {
        self.next_fd += 1;
        let fd = self.next_fd;
        self.open_fds.insert(fd, (family, protocol));
        self.log
            .borrow_mut()
            .push(TransportOp::Open { family, protocol });
        Ok(fd)
    }

    fn close(&mut self, fd: RawFd) {
        self.open_fds.remove(&fd);
        self.log.borrow_mut().push(TransportOp::Close { fd });
    }

    fn join_group(
        &mut self,
        fd: RawFd,
        pif_index: u32,
        group: IpAddr,
    ) -> Result<(), TransportError> {
        self.log.borrow_mut().push(TransportOp::Join {
            fd,
            pif_index,
            group,
        });
        Ok(())
    }

    fn leave_group(
        &mut self,
        fd: RawFd,
        pif_index: u32,
        group: IpAddr,
    ) -> Result<(), TransportError> {
        self.log.borrow_mut().push(TransportOp::Leave {
            fd,
            pif_index,
            group,
        });
        Ok(())
    }

    fn send(&mut self, fd: RawFd, spec: &SendSpec) -> Result<(), TransportError> {
        self.log.borrow_mut().push(TransportOp::Send {
            fd,
            spec: spec.clone(),
        });
        Ok(())
    }

    fn recv(&mut self, _fd: RawFd) -> Result<Option<(RecvMeta, Vec<u8>)>, TransportError> {
        Ok(None)
    }
}
