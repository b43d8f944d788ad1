use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

use crate::{MDNS_GROUP_V4, MDNS_PORT};

/// The shared receive socket: bound on the any-address at port 5353 with the
/// group joined on the given interface address. Reuse flags let several
/// responders on the machine coexist.
pub fn receive_socket(interface: Ipv4Addr, loopback: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT));
    socket.bind(&bind.into())?;

    socket.join_multicast_v4(&MDNS_GROUP_V4, &interface)?;
    socket.set_multicast_loop_v4(loopback)?;
    socket.set_multicast_ttl_v4(255)?;

    UdpSocket::from_std(socket.into())
}

/// A per-interface send socket on an ephemeral port; responses to legacy
/// resolvers go out from here as well as group traffic.
pub fn send_socket(interface: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind = SocketAddr::V4(SocketAddrV4::new(interface, 0));
    socket.bind(&bind.into())?;

    socket.set_multicast_if_v4(&interface)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(255)?;

    UdpSocket::from_std(socket.into())
}
