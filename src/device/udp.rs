//! UDP bind management
//!
//! Dual-stack socket pair for a device: one IPv4 and one IPv6 socket on
//! the same port, rebindable when the listen port changes. The sockets
//! are constructed through socket2 so the v6 socket can be pinned to
//! v6-only before binding, letting both families share a port. Hosts
//! without IPv6 degrade to a v4-only bind.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// A bound dual-stack socket pair
pub struct UdpPair {
    pub v4: Arc<UdpSocket>,
    pub v6: Option<Arc<UdpSocket>>,
    /// The actual port, resolved when binding port zero
    pub port: u16,
}

fn bind_one(addr: SocketAddr, fwmark: Option<u32>) -> io::Result<UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(..) => socket2::Domain::IPV4,
        SocketAddr::V6(..) => socket2::Domain::IPV6,
    };

    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    sock.set_nonblocking(true)?;
    if addr.is_ipv6() {
        // Keep the pair disjoint so v4 can bind the same port
        sock.set_only_v6(true)?;
    }

    #[cfg(target_os = "linux")]
    if let Some(mark) = fwmark {
        sock.set_mark(mark)?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = fwmark;

    sock.bind(&addr.into())?;
    UdpSocket::from_std(sock.into())
}

impl UdpPair {
    /// Bind both families on `port` (zero picks an ephemeral port shared
    /// by both sockets). A host without IPv6 yields a v4-only pair.
    pub fn bind(port: u16, fwmark: Option<u32>) -> io::Result<Self> {
        let v4 = bind_one((Ipv4Addr::UNSPECIFIED, port).into(), fwmark)?;
        let port = v4.local_addr()?.port();
        let v6 = match bind_one((Ipv6Addr::UNSPECIFIED, port).into(), fwmark) {
            Ok(sock) => Some(Arc::new(sock)),
            Err(e) => {
                tracing::warn!("ipv6 bind failed, continuing v4-only: {}", e);
                None
            }
        };

        Ok(Self {
            v4: Arc::new(v4),
            v6,
            port,
        })
    }

    /// Send a datagram out the socket matching the target's family
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        match target {
            SocketAddr::V4(..) => self.v4.send_to(data, target).await,
            SocketAddr::V6(..) => match &self.v6 {
                Some(sock) => sock.send_to(data, target).await,
                None => Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    NetworkError::NoEndpoint.to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_shares_port() {
        let pair = UdpPair::bind(0, None).unwrap();
        assert_ne!(pair.port, 0);
        assert_eq!(pair.v4.local_addr().unwrap().port(), pair.port);
        if let Some(v6) = &pair.v6 {
            assert_eq!(v6.local_addr().unwrap().port(), pair.port);
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_v4() {
        let a = UdpPair::bind(0, None).unwrap();
        let b = UdpPair::bind(0, None).unwrap();

        let target: SocketAddr = format!("127.0.0.1:{}", b.port).parse().unwrap();
        a.send_to(b"ping", target).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = b.v4.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), a.port);
    }

    #[tokio::test]
    async fn test_rebind_after_drop() {
        let first = UdpPair::bind(0, None).unwrap();
        let port = first.port;
        drop(first);

        // The port is free again
        let second = UdpPair::bind(port, None).unwrap();
        assert_eq!(second.port, port);
    }
}
