//! Server session: one listening port pair shared by many peers.
//!
//! Incoming datagrams are routed to the owning [`RtpPeer`] by initiator id
//! or SSRC depending on the packet kind; an unknown sender only enters the
//! table by sending an invitation. Each table entry carries the liveness
//! timers: a peer must reach the MIDI port within five seconds of inviting,
//! and must keep clock syncs coming once connected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::MAX_UDP_PACKET_SIZE;
use super::peer::{DisconnectReason, PeerEvent, PeerPort, PeerStatus, RtpPeer};
use crate::address;
use crate::endpoint::UdpEndpoint;
use crate::iobytes::{BytesReader, hex_dump};
use crate::packets::command::CommandPacket;
use crate::signal::{Signal, Subscription};
use crate::timer::Timer;

const MIDI_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CK_SILENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Snapshot of one connected peer, handed to event callbacks.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u64,
    pub name: String,
    pub remote_addr: SocketAddr,
    pub ssrc: u32,
    pub latency_ms: Option<f32>,
}

struct ServerPeerEntry {
    id: u64,
    peer: RtpPeer,
    /// Control-port address the peer first spoke from.
    remote_addr: SocketAddr,
    midi_wait_timer: Timer,
    ck_timer: Timer,
}

impl ServerPeerEntry {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            name: self.peer.remote_name.clone(),
            remote_addr: self.remote_addr,
            ssrc: self.peer.remote_ssrc,
            latency_ms: self.peer.latency_ms(),
        }
    }
}

struct PeerTable {
    peers: Vec<ServerPeerEntry>,
    next_id: u64,
}

struct ServerSignals {
    connected_event: Signal<PeerInfo>,
    midi_event: Signal<Bytes>,
    status_change_event: Signal<(PeerInfo, PeerStatus)>,
}

/// Signal emissions collected under the table lock, delivered after it is
/// released so user callbacks can call back into the server.
enum Delivery {
    Connected(PeerInfo),
    Midi(Bytes),
    Status(PeerInfo, PeerStatus),
}

pub struct RtpMidiServer {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    name: String,
    base_port: u16,
    control: UdpEndpoint,
    midi: UdpEndpoint,
    table: Mutex<PeerTable>,
    signals: ServerSignals,
    cancel: CancellationToken,
}

impl RtpMidiServer {
    /// Binds the control socket on `port` and the MIDI socket on `port + 1`,
    /// failing if either is occupied, and starts listening.
    pub async fn bind(name: impl Into<String>, port: u16) -> std::io::Result<Self> {
        let name = name.into();
        let control = UdpEndpoint::bind(port).await?;
        let base_port = control.port()?;
        let midi = UdpEndpoint::bind(base_port + 1).await?;
        info!(
            "Listening for RTP MIDI connections at {} / {}, with name '{}'",
            base_port,
            base_port + 1,
            name
        );

        let shared = Arc::new(ServerShared {
            name,
            base_port,
            control,
            midi,
            table: Mutex::new(PeerTable {
                peers: Vec::new(),
                next_id: 1,
            }),
            signals: ServerSignals {
                connected_event: Signal::new(),
                midi_event: Signal::new(),
                status_change_event: Signal::new(),
            },
            cancel: CancellationToken::new(),
        });

        tokio::spawn(ServerShared::listen(Arc::clone(&shared), PeerPort::Control));
        tokio::spawn(ServerShared::listen(Arc::clone(&shared), PeerPort::Midi));

        Ok(RtpMidiServer { shared })
    }

    pub fn port(&self) -> u16 {
        self.shared.base_port
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.table.lock().await.peers.len()
    }

    pub fn on_connected<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.shared.signals.connected_event.connect(callback)
    }

    pub fn on_midi<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.shared.signals.midi_event.connect(callback)
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&(PeerInfo, PeerStatus)) + Send + Sync + 'static,
    {
        self.shared.signals.status_change_event.connect(callback)
    }

    /// Sends one batch of raw MIDI commands to every connected peer.
    pub async fn send_midi_to_all_peers(&self, commands: &[u8]) {
        let mut deliveries = Vec::new();
        {
            let mut table = self.shared.table.lock().await;
            let ids: Vec<u64> = table.peers.iter().map(|entry| entry.id).collect();
            for id in ids {
                let Some(index) = table.peers.iter().position(|entry| entry.id == id) else {
                    continue;
                };
                table.peers[index].peer.send_midi(commands);
                ServerShared::process_peer_events(&self.shared, &mut table, index, &mut deliveries)
                    .await;
            }
        }
        self.shared.deliver(deliveries);
    }

    /// Stops listening and says goodbye to every peer. The peer list is
    /// snapshotted first so nothing a goodbye triggers can touch it.
    pub async fn shutdown(&self) {
        debug!("Shutting down server '{}'", self.shared.name);
        self.shared.cancel.cancel();
        let mut entries = {
            let mut table = self.shared.table.lock().await;
            std::mem::take(&mut table.peers)
        };
        for entry in entries.iter_mut() {
            entry.peer.disconnect();
            while let Some(event) = entry.peer.poll_event() {
                if let PeerEvent::Transmit { port, data } = event {
                    let _ = self.shared.transmit(entry, port, &data).await;
                }
            }
        }
    }
}

impl Drop for RtpMidiServer {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl ServerShared {
    async fn listen(shared: Arc<ServerShared>, port: PeerPort) {
        let endpoint = match port {
            PeerPort::Control => shared.control.clone(),
            PeerPort::Midi => shared.midi.clone(),
        };
        let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    debug!("Server {:?} listener stopping", port);
                    break;
                }
                result = endpoint.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => Self::data_ready(&shared, &buf[..len], from, port).await,
                        Err(e) => {
                            error!("Error receiving on {:?} socket: {}", port, e);
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn data_ready(shared: &Arc<Self>, data: &[u8], from: SocketAddr, port: PeerPort) {
        let mut deliveries = Vec::new();
        {
            let mut table = shared.table.lock().await;
            let index = match find_peer_index(&table, data, port) {
                Some(index) => index,
                None => {
                    if CommandPacket::is_command(data) && data[2..4] == *b"IN" {
                        Self::create_peer(shared, &mut table, from, port)
                    } else {
                        debug!(
                            "Unknown peer {}, and not an invitation; ignoring {:?}-port packet [{}]",
                            from,
                            port,
                            hex_dump(data)
                        );
                        return;
                    }
                }
            };
            // Any clock sync from the peer proves liveness.
            if is_clock_sync(data) {
                Self::rearm_ck_timer(shared, &mut table.peers[index]);
            }
            table.peers[index].peer.data_ready(data, port);
            Self::process_peer_events(shared, &mut table, index, &mut deliveries).await;
        }
        shared.deliver(deliveries);
    }

    fn create_peer(
        shared: &Arc<Self>,
        table: &mut PeerTable,
        from: SocketAddr,
        port: PeerPort,
    ) -> usize {
        let id = table.next_id;
        table.next_id += 1;

        let base_port = match port {
            PeerPort::Control => from.port(),
            PeerPort::Midi => from.port().saturating_sub(1),
        };
        let control_addr = address::with_port(from, base_port);

        let mut peer = RtpPeer::new(shared.name.clone());
        peer.remote_address = Some(control_addr);
        peer.local_address = shared.control.local_addr().ok();
        peer.remote_base_port = base_port;
        info!("Connection from {}", from);

        let shared = Arc::clone(shared);
        let midi_wait_timer = Timer::once(MIDI_CONNECT_TIMEOUT, move || {
            tokio::spawn(async move {
                shared.midi_wait_expired(id).await;
            });
        });

        table.peers.push(ServerPeerEntry {
            id,
            peer,
            remote_addr: control_addr,
            midi_wait_timer,
            ck_timer: Timer::disabled(),
        });
        table.peers.len() - 1
    }

    /// The peer invited on the control port but never completed the MIDI
    /// handshake in time.
    async fn midi_wait_expired(self: Arc<Self>, id: u64) {
        let connected = {
            let table = self.table.lock().await;
            match table.peers.iter().find(|entry| entry.id == id) {
                Some(entry) => entry.peer.status().is_connected(),
                None => return,
            }
        };
        if connected {
            return;
        }
        debug!("Timeout waiting for MIDI connection, disconnecting peer {}", id);
        Self::disconnect_peer(&self, id, DisconnectReason::CkTimeout).await;
    }

    async fn disconnect_peer(shared: &Arc<Self>, id: u64, reason: DisconnectReason) {
        let mut deliveries = Vec::new();
        {
            let mut table = shared.table.lock().await;
            let Some(index) = table.peers.iter().position(|entry| entry.id == id) else {
                return;
            };
            table.peers[index].peer.disconnect_because(reason);
            Self::process_peer_events(shared, &mut table, index, &mut deliveries).await;
        }
        shared.deliver(deliveries);
    }

    fn rearm_ck_timer(shared: &Arc<Self>, entry: &mut ServerPeerEntry) {
        let shared = Arc::clone(shared);
        let id = entry.id;
        // Reassignment cancels the previous deadline.
        entry.ck_timer = Timer::once(CK_SILENCE_TIMEOUT, move || {
            tokio::spawn(async move {
                debug!("No clock sync from peer {} in {:?}", id, CK_SILENCE_TIMEOUT);
                ServerShared::disconnect_peer(&shared, id, DisconnectReason::CkTimeout).await;
            });
        });
    }

    async fn transmit(
        &self,
        entry: &mut ServerPeerEntry,
        port: PeerPort,
        data: &[u8],
    ) -> Result<(), ()> {
        let target_port = match port {
            PeerPort::Control => entry.peer.remote_base_port,
            PeerPort::Midi => entry.peer.remote_base_port + 1,
        };
        let target = address::with_port(entry.remote_addr, target_port);
        let endpoint = match port {
            PeerPort::Control => self.control.clone(),
            PeerPort::Midi => self.midi.clone(),
        };
        match endpoint.send_to(data, target).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Error sending to {}: {}", target, e);
                Err(())
            }
        }
    }

    /// Drains one entry's peer actions. Removal on a terminal status happens
    /// here, after the state machine has fully unwound, and the collected
    /// signal emissions run only once the table lock is gone.
    async fn process_peer_events(
        shared: &Arc<Self>,
        table: &mut PeerTable,
        index: usize,
        deliveries: &mut Vec<Delivery>,
    ) {
        let mut remove = false;
        loop {
            let entry = &mut table.peers[index];
            let Some(event) = entry.peer.poll_event() else {
                break;
            };
            match event {
                PeerEvent::Transmit { port, data } => {
                    if shared.transmit(entry, port, &data).await.is_err() {
                        entry.peer.set_network_error();
                    }
                }
                PeerEvent::StatusChanged(status) => {
                    deliveries.push(Delivery::Status(entry.info(), status));
                    if status == PeerStatus::Connected {
                        entry.midi_wait_timer.disable();
                        Self::rearm_ck_timer(shared, entry);
                        deliveries.push(Delivery::Connected(entry.info()));
                    }
                    if status.is_disconnected() {
                        remove = true;
                    }
                }
                PeerEvent::MidiReceived(data) => deliveries.push(Delivery::Midi(data)),
                PeerEvent::ClockSync { .. } => {}
            }
        }
        if remove {
            let entry = table.peers.remove(index);
            debug!("Removing peer {} from the server table", entry.id);
            // dropping the entry cancels its timers
        }
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Connected(info) => self.signals.connected_event.emit(&info),
                Delivery::Midi(data) => self.signals.midi_event.emit(&data),
                Delivery::Status(info, status) => {
                    self.signals.status_change_event.emit(&(info, status))
                }
            }
        }
    }
}

fn find_by_ssrc(table: &PeerTable, ssrc: u32) -> Option<usize> {
    if ssrc == 0 {
        return None;
    }
    table
        .peers
        .iter()
        .position(|entry| entry.peer.remote_ssrc == ssrc)
}

fn find_by_initiator_id(table: &PeerTable, initiator_id: u32) -> Option<usize> {
    if initiator_id == 0 {
        return None;
    }
    table
        .peers
        .iter()
        .position(|entry| entry.peer.initiator_id == initiator_id)
}

/// Routes a datagram to its table entry. Commands identify the session by
/// initiator id (IN/OK/NO), or by SSRC (BY at offset 12, CK/RS at offset 4);
/// MIDI data packets carry the SSRC at offset 8.
fn find_peer_index(table: &PeerTable, data: &[u8], port: PeerPort) -> Option<usize> {
    let mut reader = BytesReader::new(data);
    if CommandPacket::is_command(data) {
        match &data[2..4] {
            b"IN" | b"OK" | b"NO" => {
                reader.seek(8).ok()?;
                find_by_initiator_id(table, reader.read_u32().ok()?)
            }
            b"BY" => {
                reader.seek(12).ok()?;
                find_by_ssrc(table, reader.read_u32().ok()?)
            }
            b"CK" | b"RS" => {
                reader.seek(4).ok()?;
                find_by_ssrc(table, reader.read_u32().ok()?)
            }
            _ => None,
        }
    } else if port == PeerPort::Midi && data.len() > 12 && data[1] & 0x7F == 0x61 {
        reader.seek(8).ok()?;
        find_by_ssrc(table, reader.read_u32().ok()?)
    } else {
        None
    }
}

fn is_clock_sync(data: &[u8]) -> bool {
    CommandPacket::is_command(data) && data[2..4] == *b"CK"
}
