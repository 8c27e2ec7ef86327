//
// Copyright (c) The bfdd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

use nix::sys::socket::{self, sockopt, ControlMessageOwned, MsgFlags, SockaddrStorage};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{Error, IoError};
use crate::master::{ProtocolInputMsg, SockKey};

// Well-known BFD UDP ports (RFC 5881/5883/5884).
pub const PORT_DST_SINGLE_HOP: u16 = 3784;
pub const PORT_DST_ECHO: u16 = 3785;
pub const PORT_DST_MULTIHOP: u16 = 4784;
pub const PORT_SRC_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

pub const TTL_MAX: u8 = 255;

// Linux doesn't expose this constant via `libc` on all targets.
const IPV6_MINHOPCOUNT: i32 = 73;

// Address family of a `Transport` socket, fixed at creation time so the
// receive path knows which ancillary-data shape to expect without having
// to sniff it from the returned address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl From<IpAddr> for AddressFamily {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

// Metadata recovered from a received packet's ancillary data: single-hop
// sessions only need the source address (the kernel already filtered by
// destination port); multihop sessions additionally need the destination
// address, to form the reverse `MhopKey`, and the IP TTL, checked against
// the configured minimum by the kernel via `IP_MINTTL`/`IPV6_MINHOPCOUNT`
// (RFC 5883 §5), so userspace only needs to know a packet was accepted.
#[derive(Clone, Copy, Debug)]
pub enum PacketInfo {
    IpSingleHop { src: IpAddr },
    IpMultihop { src: IpAddr, dst: IpAddr },
}

impl PacketInfo {
    pub fn src(&self) -> IpAddr {
        match self {
            PacketInfo::IpSingleHop { src } => *src,
            PacketInfo::IpMultihop { src, .. } => *src,
        }
    }
}

// Opens and binds a receive socket for `family` on `port`, enabling the
// ancillary data needed to recover the destination address
// (`IP_PKTINFO`/`IPV6_RECVPKTINFO`) and, when `min_ttl` is set, the
// kernel-enforced GTSM check used by multihop sessions.
pub fn socket_rx(family: AddressFamily, port: u16, min_ttl: Option<u8>) -> Result<Socket, Error> {
    let (domain, bind_addr) = match family {
        AddressFamily::Ipv4 => (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        AddressFamily::Ipv6 => (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::from(IoError::SocketError(e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::from(IoError::SocketError(e)))?;
    socket
        .bind(&SocketAddr::new(bind_addr, port).into())
        .map_err(|e| Error::from(IoError::SocketError(e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::from(IoError::SocketError(e)))?;

    let fd = socket.as_raw_fd();
    match family {
        AddressFamily::Ipv4 => {
            set_ipv4_pktinfo(fd)?;
            if let Some(min_ttl) = min_ttl {
                set_ipv4_min_ttl(fd, min_ttl)?;
            }
        }
        AddressFamily::Ipv6 => {
            set_ipv6_recv_pktinfo(fd)?;
            if let Some(min_ttl) = min_ttl {
                // nix has no typed wrapper for IPV6_MINHOPCOUNT.
                setsockopt_i32(fd, libc::IPPROTO_IPV6, IPV6_MINHOPCOUNT, min_ttl as i32)?;
            }
        }
    }

    Ok(socket)
}

// Opens a transmit socket sourced from the ephemeral port range, carrying
// the given TTL/hop-limit (255 for single-hop, the configured `mh_ttl`
// for multihop, per RFC 5881 §4/RFC 5883 §5).
pub fn socket_tx(local_addr: IpAddr, ttl: u8) -> Result<Socket, Error> {
    let domain = match local_addr {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::from(IoError::SocketError(e)))?;
    socket
        .bind(&SocketAddr::new(local_addr, 0).into())
        .map_err(|e| Error::from(IoError::SocketError(e)))?;

    match local_addr {
        IpAddr::V4(_) => socket.set_ttl(ttl as u32),
        IpAddr::V6(_) => socket.set_unicast_hops(ttl as u32),
    }
    .map_err(|e| Error::from(IoError::SocketError(e)))?;

    Ok(socket)
}

// Sends an already-encoded packet to `dst` on `port`.
pub fn send_packet(socket: &Socket, buf: &[u8], dst: IpAddr, port: u16) -> Result<(), Error> {
    let addr = SocketAddr::new(dst, port);
    socket
        .send_to(buf, &addr.into())
        .map_err(|e| Error::from(IoError::SendError(e)))?;
    Ok(())
}

// Receives one packet off `socket`, returning its payload length and the
// `PacketInfo` recovered from its source address and (for multihop
// sockets) destination-address ancillary data.
pub fn recv_packet(
    socket: &Socket,
    family: AddressFamily,
    buf: &mut [u8],
    multihop: bool,
) -> Result<(usize, PacketInfo), Error> {
    let fd = socket.as_raw_fd();
    let mut cmsg_buf = match family {
        AddressFamily::Ipv4 => nix::cmsg_space!(libc::in_pktinfo),
        AddressFamily::Ipv6 => nix::cmsg_space!(libc::in6_pktinfo),
    };
    let mut iov = [std::io::IoSliceMut::new(buf)];

    let msg = socket::recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
        .map_err(|e| Error::from(IoError::RecvError(io::Error::from(e))))?;

    let src = msg
        .address
        .and_then(sockaddr_to_ip)
        .ok_or_else(|| Error::from(IoError::RecvMissingSourceAddr))?;

    let mut dst = None;
    for cmsg in msg
        .cmsgs()
        .map_err(|e| Error::from(IoError::RecvError(io::Error::from(e))))?
    {
        match cmsg {
            ControlMessageOwned::Ipv4PacketInfo(pktinfo) => {
                dst = Some(IpAddr::V4(Ipv4Addr::from(
                    u32::from_be(pktinfo.ipi_addr.s_addr).to_be_bytes(),
                )));
            }
            ControlMessageOwned::Ipv6PacketInfo(pktinfo) => {
                dst = Some(IpAddr::V6(Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr)));
            }
            _ => {}
        }
    }

    let info = if multihop {
        PacketInfo::IpMultihop {
            src,
            dst: dst.ok_or_else(|| Error::from(IoError::RecvMissingAncillaryData))?,
        }
    } else {
        PacketInfo::IpSingleHop { src }
    };

    Ok((msg.bytes, info))
}

// Drives one listening socket's receive loop: waits for readability, decodes
// ancillary data off the packet, and posts it onto the dispatcher's input
// queue. One function covers what would otherwise be a separate
// northbound/southbound task split, since this core has no such split to
// keep apart.
pub async fn rx_loop(
    socket: Socket,
    sock_key: SockKey,
    family: AddressFamily,
    multihop: bool,
    input_tx: tokio::sync::mpsc::UnboundedSender<ProtocolInputMsg>,
) {
    let socket = match UdpSocket::from_std(socket.into()) {
        Ok(socket) => socket,
        Err(error) => {
            Error::from(IoError::SocketError(error)).log();
            return;
        }
    };

    let mut buf = [0u8; 1500];
    loop {
        if let Err(error) = socket.readable().await {
            Error::from(IoError::RecvError(error)).log();
            return;
        }

        let sock_ref = socket2::SockRef::from(&socket);
        match recv_packet(&sock_ref, family, &mut buf, multihop) {
            Ok((len, info)) => {
                let msg = ProtocolInputMsg::RxPacket {
                    sock_key,
                    info,
                    data: buf[..len].to_vec(),
                };
                if input_tx.send(msg).is_err() {
                    return;
                }
            }
            Err(Error::IoError(IoError::RecvError(error)))
                if error.kind() == io::ErrorKind::WouldBlock =>
            {
                // Spurious readiness (e.g. another task drained the
                // datagram first); go back to waiting.
            }
            Err(error) => error.log(),
        }
    }
}

fn sockaddr_to_ip(addr: SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(v4.ip()).to_be_bytes())))
    } else {
        addr.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
    }
}

fn set_ipv4_pktinfo(fd: i32) -> Result<(), Error> {
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    socket::setsockopt(&fd, sockopt::Ipv4PacketInfo, &true)
        .map_err(|e| Error::from(IoError::SocketError(io::Error::from(e))))
}

fn set_ipv6_recv_pktinfo(fd: i32) -> Result<(), Error> {
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    socket::setsockopt(&fd, sockopt::Ipv6RecvPacketInfo, &true)
        .map_err(|e| Error::from(IoError::SocketError(io::Error::from(e))))
}

fn set_ipv4_min_ttl(fd: i32, min_ttl: u8) -> Result<(), Error> {
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    socket::setsockopt(&fd, sockopt::IpMinTtl, &(min_ttl as libc::c_int))
        .map_err(|e| Error::from(IoError::SocketError(io::Error::from(e))))
}

// IPV6_MINHOPCOUNT has no typed wrapper in `nix`; kept as a raw setsockopt.
fn setsockopt_i32(fd: i32, level: i32, name: i32, value: i32) -> Result<(), Error> {
    // SAFETY: `fd` is a valid, open socket for the lifetime of this call;
    // `value` points at a plain-old-data sockopt payload of the size the
    // kernel expects for `(level, name)`, and setsockopt(2) doesn't retain
    // the pointer past the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::from(IoError::SocketError(io::Error::last_os_error())));
    }
    Ok(())
}
