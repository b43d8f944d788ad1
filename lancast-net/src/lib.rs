use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

pub mod receiver;
pub mod sender;
pub mod socket;

/// The well known mDNS port.
pub const MDNS_PORT: u16 = 5353;

/// Largest datagram we will try to receive in one piece.
pub const MAX_DATAGRAM_SIZE: usize = 9000;

/// IPv4 link local multicast group for mDNS.
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// IPv6 mirror of the group.
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xFB);

/// Where multicast traffic goes when no unicast destination is given.
pub fn group_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT))
}

/// One datagram, either direction.
#[derive(Debug, Clone)]
pub struct Message {
    pub address: SocketAddr,
    pub bytes: Vec<u8>,
}
