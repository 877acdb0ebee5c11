use std::net::UdpSocket;

/// Finds `count` disjoint pairs of consecutive free UDP ports. All probe
/// sockets stay bound until every pair is found so the pairs cannot overlap.
pub fn find_consecutive_port_pairs(count: usize) -> Vec<(u16, u16)> {
    let mut held = Vec::new();
    let mut pairs = Vec::new();
    while pairs.len() < count {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = socket.local_addr().unwrap().port();
        if let Ok(next) = UdpSocket::bind(("0.0.0.0", port + 1)) {
            pairs.push((port, port + 1));
            held.push(socket);
            held.push(next);
        }
    }
    pairs
}

#[allow(dead_code)]
pub fn find_consecutive_ports() -> (u16, u16) {
    find_consecutive_port_pairs(1)[0]
}
