//! Dual-stack UDP sockets for the session engine.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::address;

/// A UDP socket bound on `::` so IPv4 peers arrive as v4-mapped addresses.
/// Cheap to clone; all clones share the same socket.
#[derive(Debug, Clone)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
}

impl UdpEndpoint {
    /// Binds the endpoint. Port 0 picks an ephemeral port; any other port
    /// fails if it is already occupied.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)).await?;
        debug!("Bound UDP endpoint on {}", socket.local_addr()?);
        Ok(UdpEndpoint {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Sends one datagram. Returns the number of bytes written; the caller
    /// decides what a short or failed send means for the session.
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        let target = address::sendable(target);
        let sent = self.socket.send_to(data, target).await?;
        trace!("Sent {} bytes to {}", sent, target);
        Ok(sent)
    }

    /// Receives one datagram. The source address is folded back to plain
    /// IPv4 when it arrives v4-mapped.
    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let (len, from) = self.socket.recv_from(buf).await?;
        trace!("Received {} bytes from {}", len, from);
        Ok((len, address::canonical(from)))
    }
}
