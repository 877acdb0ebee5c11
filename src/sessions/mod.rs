pub mod client;
#[cfg(feature = "mdns")]
pub mod mdns;
pub mod peer;
pub mod server;

const MAX_UDP_PACKET_SIZE: usize = 65535;
