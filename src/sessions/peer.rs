//! Per-peer RTP-MIDI session state machine.
//!
//! [`RtpPeer`] does no I/O of its own: callers feed raw datagrams in with
//! [`RtpPeer::data_ready`] and drain the resulting actions (packets to
//! transmit, status transitions, decoded MIDI, clock-sync results) with
//! [`RtpPeer::poll_event`]. The client and server sessions own the sockets
//! and timers around it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::iobytes::{BytesWriter, hex_dump};
use crate::packets::RtpMidiPacket;
use crate::packets::command::{ClockSync, CommandPacket, ReceiverFeedback, SessionExchange};
use crate::packets::midi::{self, MidiPacket};

/// Scratch size for composing outbound packets; one MTU's worth.
const SCRATCH_SIZE: usize = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPort {
    Control,
    Midi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ByPeer,
    NetworkError,
    CkTimeout,
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerStatus {
    #[default]
    NotConnected,
    ControlConnected,
    MidiConnected,
    Connected,
    Disconnected(DisconnectReason),
}

impl PeerStatus {
    pub fn is_connected(self) -> bool {
        self == PeerStatus::Connected
    }

    pub fn has_control(self) -> bool {
        matches!(self, PeerStatus::ControlConnected | PeerStatus::Connected)
    }

    pub fn has_midi(self) -> bool {
        matches!(self, PeerStatus::MidiConnected | PeerStatus::Connected)
    }

    pub fn is_disconnected(self) -> bool {
        matches!(self, PeerStatus::Disconnected(_))
    }

    fn with_port_set(self, port: PeerPort) -> Self {
        match (self, port) {
            (PeerStatus::NotConnected, PeerPort::Control) => PeerStatus::ControlConnected,
            (PeerStatus::NotConnected, PeerPort::Midi) => PeerStatus::MidiConnected,
            (PeerStatus::ControlConnected, PeerPort::Midi) => PeerStatus::Connected,
            (PeerStatus::MidiConnected, PeerPort::Control) => PeerStatus::Connected,
            (status, _) => status,
        }
    }

    fn with_port_cleared(self, port: PeerPort) -> Self {
        match (self, port) {
            (PeerStatus::Connected, PeerPort::Control) => PeerStatus::MidiConnected,
            (PeerStatus::Connected, PeerPort::Midi) => PeerStatus::ControlConnected,
            (PeerStatus::ControlConnected, PeerPort::Control) => PeerStatus::NotConnected,
            (PeerStatus::MidiConnected, PeerPort::Midi) => PeerStatus::NotConnected,
            (status, _) => status,
        }
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::NotConnected => write!(f, "not connected"),
            PeerStatus::ControlConnected => write!(f, "control connected"),
            PeerStatus::MidiConnected => write!(f, "midi connected"),
            PeerStatus::Connected => write!(f, "connected"),
            PeerStatus::Disconnected(DisconnectReason::ByPeer) => {
                write!(f, "disconnected by peer")
            }
            PeerStatus::Disconnected(DisconnectReason::NetworkError) => {
                write!(f, "disconnected, network error")
            }
            PeerStatus::Disconnected(DisconnectReason::CkTimeout) => {
                write!(f, "disconnected, clock sync timeout")
            }
            PeerStatus::Disconnected(DisconnectReason::Reconnect) => {
                write!(f, "disconnected to reconnect")
            }
        }
    }
}

/// Actions and notifications produced by the state machine, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Transmit { port: PeerPort, data: Bytes },
    StatusChanged(PeerStatus),
    MidiReceived(Bytes),
    ClockSync { latency_ms: f32 },
}

pub struct RtpPeer {
    local_name: String,
    pub remote_name: String,
    pub local_ssrc: u32,
    pub remote_ssrc: u32,
    /// Chosen by the initiating side; correlates IN/OK/NO across both ports
    /// before SSRCs are known.
    pub initiator_id: u32,
    status: PeerStatus,
    seq_nr_out: u16,
    seq_nr_in: Option<u16>,
    remote_acknowledged: Option<u16>,
    pub remote_base_port: u16,
    timestamp_start: Instant,
    latency_ms: Option<f32>,
    ck_pending: bool,
    first_midi_sent: bool,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    events: VecDeque<PeerEvent>,
}

impl RtpPeer {
    pub fn new(local_name: impl Into<String>) -> Self {
        RtpPeer {
            local_name: local_name.into(),
            remote_name: String::new(),
            local_ssrc: rand::random::<u32>(),
            remote_ssrc: 0,
            initiator_id: 0,
            status: PeerStatus::NotConnected,
            seq_nr_out: 0,
            seq_nr_in: None,
            remote_acknowledged: None,
            remote_base_port: 0,
            timestamp_start: Instant::now(),
            latency_ms: None,
            ck_pending: false,
            first_midi_sent: false,
            local_address: None,
            remote_address: None,
            events: VecDeque::new(),
        }
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn latency_ms(&self) -> Option<f32> {
        self.latency_ms
    }

    /// Next pending action, oldest first.
    pub fn poll_event(&mut self) -> Option<PeerEvent> {
        self.events.pop_front()
    }

    /// Current session time in the AppleMIDI unit of 100 microsecond ticks.
    fn now_ticks(&self) -> u64 {
        (self.timestamp_start.elapsed().as_micros() / 100) as u64
    }

    fn set_status(&mut self, status: PeerStatus) {
        if status != self.status {
            debug!(
                "Peer '{}' status: {} -> {}",
                self.remote_name, self.status, status
            );
            self.status = status;
            self.events.push_back(PeerEvent::StatusChanged(status));
        }
    }

    fn send_command(&mut self, packet: &CommandPacket, port: PeerPort) {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let mut writer = BytesWriter::new(&mut scratch);
        match packet.write(&mut writer) {
            Ok(()) => self.events.push_back(PeerEvent::Transmit {
                port,
                data: Bytes::copy_from_slice(writer.written()),
            }),
            Err(e) => warn!("Could not serialise command packet: {}", e),
        }
    }

    /// Initiator role: compose the invitation for the given port.
    pub fn connect_to(&mut self, port: PeerPort) {
        if self.initiator_id == 0 {
            self.initiator_id = rand::random::<u32>();
        }
        debug!(
            "Inviting peer on {:?} port, initiator id {:08x}",
            port, self.initiator_id
        );
        let invitation = CommandPacket::Invitation(SessionExchange {
            initiator_id: self.initiator_id,
            ssrc: self.local_ssrc,
            name: Some(self.local_name.clone()),
        });
        self.send_command(&invitation, port);
    }

    /// Feed one datagram received on the given port.
    pub fn data_ready(&mut self, data: &[u8], port: PeerPort) {
        if self.status.is_disconnected() {
            debug!("Peer already disconnected, dropping packet");
            return;
        }
        match RtpMidiPacket::parse(data) {
            Ok(RtpMidiPacket::Command(command)) => self.handle_command(command, port),
            Ok(RtpMidiPacket::Midi(packet)) => {
                if port == PeerPort::Midi {
                    self.handle_midi(&packet);
                } else {
                    debug!("MIDI data packet on the control port, ignoring");
                }
            }
            Err(e) => {
                debug!(
                    "Dropping malformed packet on {:?} port: {} [{}]",
                    port,
                    e,
                    hex_dump(data)
                );
            }
        }
    }

    fn handle_command(&mut self, command: CommandPacket, port: PeerPort) {
        match command {
            CommandPacket::Invitation(body) => self.handle_invitation(body, port),
            CommandPacket::Acceptance(body) => self.handle_acceptance(body, port),
            CommandPacket::Rejection(_) => {
                info!("Session rejected by '{}'", self.remote_name);
                self.set_status(PeerStatus::Disconnected(DisconnectReason::ByPeer));
            }
            CommandPacket::Goodbye(body) => self.handle_goodbye(body),
            CommandPacket::ClockSync(body) => self.handle_clock_sync(body, port),
            CommandPacket::ReceiverFeedback(body) => self.handle_receiver_feedback(body),
        }
    }

    /// Responder role: answer invitations with OK, matching the MIDI-port
    /// invitation to the control-port one by initiator id.
    fn handle_invitation(&mut self, body: SessionExchange, port: PeerPort) {
        match (self.status, port) {
            (PeerStatus::NotConnected, PeerPort::Control) => {
                self.initiator_id = body.initiator_id;
                self.remote_ssrc = body.ssrc;
                self.remote_name = body.name.unwrap_or_default();
                info!(
                    "Invitation from '{}' (ssrc {:08x})",
                    self.remote_name, self.remote_ssrc
                );
                self.send_acceptance(port);
                self.set_status(PeerStatus::ControlConnected);
            }
            (PeerStatus::ControlConnected, PeerPort::Midi)
                if body.initiator_id == self.initiator_id =>
            {
                self.send_acceptance(port);
                self.set_status(PeerStatus::Connected);
            }
            (PeerStatus::ControlConnected, PeerPort::Midi) => {
                warn!(
                    "MIDI-port invitation for initiator {:08x}, expected {:08x}; rejecting",
                    body.initiator_id, self.initiator_id
                );
                let rejection = CommandPacket::Rejection(SessionExchange {
                    initiator_id: body.initiator_id,
                    ssrc: self.local_ssrc,
                    name: None,
                });
                self.send_command(&rejection, port);
            }
            (PeerStatus::ControlConnected, PeerPort::Control)
            | (PeerStatus::Connected, _) => {
                debug!("Duplicate invitation on {:?} port, repeating acceptance", port);
                self.send_acceptance(port);
            }
            (status, port) => {
                debug!("Invitation in status '{}' on {:?} port, ignoring", status, port);
            }
        }
    }

    fn send_acceptance(&mut self, port: PeerPort) {
        let acceptance = CommandPacket::Acceptance(SessionExchange {
            initiator_id: self.initiator_id,
            ssrc: self.local_ssrc,
            name: Some(self.local_name.clone()),
        });
        self.send_command(&acceptance, port);
    }

    /// Initiator role: an OK for our invitation. Late or repeated OKs after
    /// the state already advanced are ignored.
    fn handle_acceptance(&mut self, body: SessionExchange, port: PeerPort) {
        if body.initiator_id != self.initiator_id {
            debug!(
                "Acceptance for initiator {:08x}, expected {:08x}; ignoring",
                body.initiator_id, self.initiator_id
            );
            return;
        }
        match (self.status, port) {
            (PeerStatus::NotConnected, PeerPort::Control) => {
                self.remote_ssrc = body.ssrc;
                self.remote_name = body.name.unwrap_or_default();
                info!(
                    "Control port accepted by '{}' (ssrc {:08x})",
                    self.remote_name, self.remote_ssrc
                );
                self.set_status(PeerStatus::ControlConnected);
            }
            (PeerStatus::ControlConnected, PeerPort::Midi) => {
                info!("MIDI port accepted by '{}'", self.remote_name);
                self.set_status(PeerStatus::Connected);
            }
            (status, port) => {
                debug!("Late acceptance in status '{}' on {:?} port, ignoring", status, port);
            }
        }
    }

    fn handle_goodbye(&mut self, body: SessionExchange) {
        if self.remote_ssrc != 0 && body.ssrc != self.remote_ssrc {
            debug!("Goodbye for ssrc {:08x}, not this session; ignoring", body.ssrc);
            return;
        }
        info!("Goodbye from '{}'", self.remote_name);
        self.set_status(PeerStatus::Disconnected(DisconnectReason::ByPeer));
    }

    fn handle_clock_sync(&mut self, body: ClockSync, port: PeerPort) {
        if self.remote_ssrc != 0 && body.ssrc != self.remote_ssrc {
            debug!("Clock sync from ssrc {:08x}, not this session; ignoring", body.ssrc);
            return;
        }
        match body.count {
            0 => {
                let reply = CommandPacket::ClockSync(ClockSync {
                    ssrc: self.local_ssrc,
                    count: 1,
                    timestamps: [body.timestamps[0], self.now_ticks(), 0],
                });
                self.send_command(&reply, port);
            }
            1 => {
                let ts3 = self.now_ticks();
                let latency_ms = ts3.saturating_sub(body.timestamps[0]) as f32 / 20.0;
                if !self.ck_pending {
                    warn!("Out of order CK response, latency: {} ms", latency_ms);
                }
                self.ck_pending = false;
                self.latency_ms = Some(latency_ms);
                let reply = CommandPacket::ClockSync(ClockSync {
                    ssrc: self.local_ssrc,
                    count: 2,
                    timestamps: [body.timestamps[0], body.timestamps[1], ts3],
                });
                self.send_command(&reply, port);
                self.events.push_back(PeerEvent::ClockSync { latency_ms });
            }
            2 => {
                let latency_ms =
                    body.timestamps[2].saturating_sub(body.timestamps[0]) as f32 / 20.0;
                debug!(
                    "Clock sync with '{}' finalised, latency {} ms",
                    self.remote_name, latency_ms
                );
                self.latency_ms = Some(latency_ms);
                self.events.push_back(PeerEvent::ClockSync { latency_ms });
            }
            count => {
                debug!("Unexpected clock sync count {}, ignoring", count);
            }
        }
    }

    fn handle_receiver_feedback(&mut self, body: ReceiverFeedback) {
        let seq = (body.seq_nr >> 16) as u16;
        trace!("Peer acknowledged up to sequence {}", seq);
        self.remote_acknowledged = Some(seq);
    }

    fn handle_midi(&mut self, packet: &MidiPacket) {
        if self.remote_ssrc != 0 && packet.ssrc() != self.remote_ssrc {
            debug!(
                "MIDI packet from ssrc {:08x}, not this session; ignoring",
                packet.ssrc()
            );
            return;
        }
        let seq = packet.sequence_number();
        if let Some(previous) = self.seq_nr_in
            && seq != previous.wrapping_add(1)
        {
            // No journal recovery; the gap is only reported.
            warn!(
                "Lost packets from '{}': previous sequence {}, current {}",
                self.remote_name, previous, seq
            );
        }
        self.seq_nr_in = Some(seq);

        for command in packet.commands() {
            match command {
                Ok(command) => {
                    trace!("MIDI command {:02x}, {} data bytes", command.status, command.data.len());
                    self.events
                        .push_back(PeerEvent::MidiReceived(command.to_bytes()));
                }
                Err(e) => {
                    debug!("Malformed MIDI command list: {}", e);
                    break;
                }
            }
        }

        let feedback = CommandPacket::ReceiverFeedback(ReceiverFeedback {
            ssrc: self.local_ssrc,
            seq_nr: (seq as u32) << 16,
        });
        self.send_command(&feedback, PeerPort::Control);
    }

    /// Serialise raw MIDI commands into one data packet. Does nothing unless
    /// the session is fully connected.
    pub fn send_midi(&mut self, commands: &[u8]) {
        if !self.status.is_connected() {
            debug!("Not connected, dropping outbound MIDI");
            return;
        }
        let mut scratch = [0u8; SCRATCH_SIZE];
        let mut writer = BytesWriter::new(&mut scratch);
        let marker = !self.first_midi_sent;
        match midi::write_midi_packet(
            &mut writer,
            marker,
            self.seq_nr_out,
            self.now_ticks() as u32,
            self.local_ssrc,
            commands,
            Some(self.seq_nr_out),
        ) {
            Ok(()) => {
                self.first_midi_sent = true;
                self.seq_nr_out = self.seq_nr_out.wrapping_add(1);
                self.events.push_back(PeerEvent::Transmit {
                    port: PeerPort::Midi,
                    data: Bytes::copy_from_slice(writer.written()),
                });
            }
            Err(e) => warn!("Could not serialise MIDI packet: {}", e),
        }
    }

    /// Start a clock-sync exchange (initiator side).
    pub fn send_ck0(&mut self) {
        if !self.status.is_connected() {
            debug!("Not connected, not sending clock sync");
            return;
        }
        self.ck_pending = true;
        let ck = CommandPacket::ClockSync(ClockSync {
            ssrc: self.local_ssrc,
            count: 0,
            timestamps: [self.now_ticks(), 0, 0],
        });
        self.send_command(&ck, PeerPort::Midi);
    }

    /// Send BY on one port and clear that port's connected flag.
    pub fn send_goodbye(&mut self, port: PeerPort) {
        let goodbye = CommandPacket::Goodbye(SessionExchange {
            initiator_id: self.initiator_id,
            ssrc: self.local_ssrc,
            name: None,
        });
        self.send_command(&goodbye, port);
        self.set_status(self.status.with_port_cleared(port));
    }

    /// Send BY on every connected port and mark the session as disconnected
    /// for reconnection.
    pub fn disconnect(&mut self) {
        self.disconnect_because(DisconnectReason::Reconnect);
    }

    pub fn disconnect_because(&mut self, reason: DisconnectReason) {
        if self.status.is_disconnected() {
            return;
        }
        let goodbye = CommandPacket::Goodbye(SessionExchange {
            initiator_id: self.initiator_id,
            ssrc: self.local_ssrc,
            name: None,
        });
        if self.status.has_control() {
            self.send_command(&goodbye, PeerPort::Control);
        }
        if self.status.has_midi() {
            self.send_command(&goodbye, PeerPort::Midi);
        }
        self.set_status(PeerStatus::Disconnected(reason));
    }

    /// A socket operation for this peer failed; the session is over.
    pub fn set_network_error(&mut self) {
        if !self.status.is_disconnected() {
            self.set_status(PeerStatus::Disconnected(DisconnectReason::NetworkError));
        }
    }
}

impl std::fmt::Debug for RtpPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPeer")
            .field("local_name", &self.local_name)
            .field("remote_name", &self.remote_name)
            .field("local_ssrc", &format_args!("{:08x}", self.local_ssrc))
            .field("remote_ssrc", &format_args!("{:08x}", self.remote_ssrc))
            .field("initiator_id", &format_args!("{:08x}", self.initiator_id))
            .field("status", &self.status)
            .field("seq_nr_out", &self.seq_nr_out)
            .field("seq_nr_in", &self.seq_nr_in)
            .finish()
    }
}
