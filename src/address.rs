//! Endpoint resolution helpers.
//!
//! `std::net::SocketAddr` already gives us an owned, uniformly formatted
//! IPv4/IPv6 address value, so this module only adds what the session engine
//! needs on top: resolving a `(hostname, port string)` candidate into its
//! address list, deriving the paired MIDI port address, and normalising
//! v4-mapped addresses coming off the dual-stack sockets.

use std::net::{IpAddr, SocketAddr};

use tracing::debug;

/// Resolves one discovery candidate into its UDP address list, in resolver
/// order. The port is the textual form carried by DNS-SD records.
pub async fn resolve(hostname: &str, port: &str) -> std::io::Result<Vec<SocketAddr>> {
    let port: u16 = port.parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid port {port:?}"),
        )
    })?;
    let addresses: Vec<SocketAddr> = tokio::net::lookup_host((hostname, port)).await?.collect();
    debug!("Resolved {}:{} to {:?}", hostname, port, addresses);
    Ok(addresses)
}

/// Same address, different port.
pub fn with_port(addr: SocketAddr, port: u16) -> SocketAddr {
    let mut addr = addr;
    addr.set_port(port);
    addr
}

/// Folds a v4-mapped IPv6 address (`::ffff:a.b.c.d`) back to plain IPv4 so
/// peers arriving over the dual-stack sockets compare equal to their
/// resolved IPv4 form.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// The opposite direction: dual-stack IPv6 sockets on some platforms refuse a
/// plain IPv4 destination, so outbound targets are lifted to v4-mapped form.
pub fn sendable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_numeric() {
        let addresses = resolve("127.0.0.1", "5004").await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0], "127.0.0.1:5004".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_bad_port() {
        assert!(resolve("127.0.0.1", "not-a-port").await.is_err());
    }

    #[test]
    fn test_with_port() {
        let addr: SocketAddr = "10.0.0.1:5004".parse().unwrap();
        assert_eq!(with_port(addr, 5005), "10.0.0.1:5005".parse().unwrap());
    }

    #[test]
    fn test_canonical_folds_mapped() {
        let mapped: SocketAddr = "[::ffff:192.168.1.2]:5004".parse().unwrap();
        assert_eq!(canonical(mapped), "192.168.1.2:5004".parse().unwrap());
        let v6: SocketAddr = "[fe80::1]:5004".parse().unwrap();
        assert_eq!(canonical(v6), v6);
    }

    #[test]
    fn test_sendable_lifts_v4() {
        let v4: SocketAddr = "192.168.1.2:5004".parse().unwrap();
        assert_eq!(sendable(v4), "[::ffff:192.168.1.2]:5004".parse().unwrap());
        assert_eq!(canonical(sendable(v4)), v4);
    }
}
