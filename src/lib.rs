//! RTP-MIDI / AppleMIDI session engine for carrying MIDI 1.0 streams over
//! UDP between peers on a local network.
//!
//! This library is designed to be used with the `tokio` async runtime. It
//! provides the two sides of the session protocol plus the service
//! discovery glue:
//!
//! - [`sessions::server::RtpMidiServer`] listens on a control/MIDI port
//!   pair, answers invitations and multiplexes any number of peers.
//! - [`sessions::client::RtpMidiClient`] dials a list of candidate
//!   endpoints, keeps the session alive with periodic clock syncs and
//!   reconnects when it is lost.
//! - `sessions::mdns::DiscoveryBridge` (behind the `mdns` feature)
//!   announces sessions as `_apple-midi._udp` and browses for others.
//!
//! MIDI crosses the API as raw MIDI 1.0 bytes: bind a callback with
//! `on_midi` for ingress and hand commands to `send_midi` for egress.
//!
//! ## Unsupported features
//! - **Recovery journal**: outgoing packets carry the empty journal
//!   header, but lost packets are not recovered, only reported.
//! - **MIDI 2.0 / UMP**: MIDI 1.0 byte streams only.

pub mod address;
pub mod endpoint;
pub mod iobytes;
pub mod packets;
pub mod sessions;
pub mod signal;
pub mod timer;
