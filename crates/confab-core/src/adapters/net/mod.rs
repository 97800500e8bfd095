//! Networking adapters: the directory server and the peer session engine.

pub mod peer;
pub mod server;
pub mod workers;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

/// Microseconds since the Unix epoch. Clock synchronization across hosts is
/// an external concern; this is only a local read.
pub fn unix_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch, as used by the statistics trackers.
pub fn unix_now_s() -> f64 {
    unix_now_us() as f64 / 1e6
}

// ---------------------------------------------------------------------------
// Multicast socket setup
// ---------------------------------------------------------------------------

/// Bind a nonblocking UDP socket on `group`'s port and join the group.
///
/// Reuse-address lets several processes on one host share the group;
/// loopback stays on so local peers hear each other (own traffic is filtered
/// by source name upstream).
pub fn multicast_receiver(group: SocketAddr) -> anyhow::Result<UdpSocket> {
    let IpAddr::V4(group_ip) = group.ip() else {
        anyhow::bail!("multicast groups are IPv4");
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port()).into())?;
    socket.join_multicast_v4(&group_ip, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// An ephemeral local UDP socket (event ingress, outbound datagrams).
pub async fn ephemeral_udp() -> anyhow::Result<UdpSocket> {
    Ok(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_socket_advertises_a_port() {
        let sock = ephemeral_udp().await.unwrap();
        assert_ne!(sock.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn clock_is_monotone_enough() {
        let a = unix_now_us();
        let b = unix_now_us();
        assert!(b >= a);
        assert!(unix_now_s() > 1.0e9, "epoch seconds sanity");
    }
}
