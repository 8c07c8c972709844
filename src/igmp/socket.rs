use super::packet::Packet;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use std::ffi::c_int;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;

/// Raw IPv4 socket bound to protocol 2 (IGMP).
///
/// Received datagrams include the IP header. With `IP_HDRINCL` set the
/// datagrams handed to [`RawIgmpSocket::send`] must include it as well, which
/// is what the engines produce.
#[derive(Debug)]
pub struct RawIgmpSocket {
    socket: Socket,
}

impl RawIgmpSocket {
    pub fn new() -> Result<Self, std::io::Error> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(libc::IPPROTO_IGMP)))?;
        Ok(Self { socket })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), std::io::Error> {
        self.socket.set_nonblocking(nonblocking)
    }

    unsafe fn setsockopt<T: Sized, O: SocketOpt>(&self, opt: O, optval: &T) -> Result<(), std::io::Error> {
        let level = opt.level();
        let optname = opt.optname();
        let code = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                level,
                optname,
                optval as *const _ as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if code < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_header_included(&self, included: bool) -> Result<(), std::io::Error> {
        let included: c_int = if included { 1 } else { 0 };
        unsafe { self.setsockopt(Ipv4Opt::IP_HDRINCL, &included) }
    }

    pub fn set_multicast_all(&self, all: bool) -> Result<(), std::io::Error> {
        let all: c_int = if all { 1 } else { 0 };
        unsafe { self.setsockopt(Ipv4Opt::IP_MULTICAST_ALL, &all) }
    }

    /// Selects the outgoing interface by one of its addresses.
    pub fn set_multicast_if(&self, interface: Ipv4Addr) -> Result<(), std::io::Error> {
        self.socket.set_multicast_if_v4(&interface)
    }

    pub fn set_multicast_loop(&self, loopback: bool) -> Result<(), std::io::Error> {
        self.socket.set_multicast_loop_v4(loopback)
    }

    pub fn join_multicast(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), std::io::Error> {
        self.socket.join_multicast_v4(&group, &interface)
    }

    pub fn leave_multicast(&self, group: Ipv4Addr, interface: Ipv4Addr) -> Result<(), std::io::Error> {
        self.socket.leave_multicast_v4(&group, &interface)
    }

    /// Receives one datagram, IP header included.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        (&self.socket).read(buf)
    }

    pub fn send(&self, packet: &Packet) -> Result<(), std::io::Error> {
        let dst = SockAddr::from(SocketAddrV4::new(packet.destination(), 0));
        let len = self.socket.send_to(packet.data(), &dst)?;
        if len != packet.data().len() {
            return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "short write on raw socket"));
        }
        Ok(())
    }

    pub fn into_async(self) -> Result<AsyncIgmpSocket, std::io::Error> {
        AsyncIgmpSocket::new(self)
    }
}

impl AsRawFd for RawIgmpSocket {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.socket.as_raw_fd()
    }
}

#[derive(Debug, Clone)]
pub struct AsyncIgmpSocket {
    inner: Arc<AsyncFd<RawIgmpSocket>>,
}

impl AsyncIgmpSocket {
    pub fn new(socket: RawIgmpSocket) -> Result<Self, std::io::Error> {
        socket.set_nonblocking(true)?;
        let inner = Arc::new(AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)?);
        Ok(Self { inner })
    }

    pub fn get_ref(&self) -> &RawIgmpSocket {
        self.inner.get_ref()
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(buf)) {
                Ok(res) => {
                    return res;
                }

                Err(_) => continue,
            }
        }
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), std::io::Error> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(packet)) {
                Ok(res) => {
                    return res;
                }

                Err(_) => continue,
            }
        }
    }
}

pub trait SocketOpt {
    fn level(&self) -> c_int;
    fn optname(&self) -> c_int;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Opt(c_int);

impl SocketOpt for Ipv4Opt {
    fn level(&self) -> c_int {
        libc::IPPROTO_IP
    }

    fn optname(&self) -> c_int {
        self.0
    }
}

impl Ipv4Opt {
    pub const IP_HDRINCL: Self = Self(libc::IP_HDRINCL);
    pub const IP_MULTICAST_ALL: Self = Self(libc::IP_MULTICAST_ALL);
}
