//! Client session: dials a server's port pair and keeps the session alive.
//!
//! The connection lifecycle is a table-driven state machine
//! (`transition`) walking a candidate list of `(hostname, port)` pairs
//! through DNS resolution, the two-port invitation handshake, periodic
//! clock syncs and timed reconnection. A driver task owns the sockets and
//! the [`RtpPeer`]; the [`RtpMidiClient`] handle talks to it over a
//! command channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use super::MAX_UDP_PACKET_SIZE;
use super::peer::{DisconnectReason, PeerEvent, PeerPort, PeerStatus, RtpPeer};
use crate::address;
use crate::endpoint::UdpEndpoint;
use crate::signal::{Signal, Subscription};

/// Clock syncs sent at the short period before settling into the long one.
const CK_SHORT_COUNT: u32 = 6;
const MIDI_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientParams {
    pub connect_timeout: Duration,
    pub ck_short_period: Duration,
    pub ck_long_period: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for ClientParams {
    fn default() -> Self {
        ClientParams {
            connect_timeout: Duration::from_secs(1),
            ck_short_period: Duration::from_millis(1500),
            ck_long_period: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// One dialing candidate, port kept in the textual form DNS-SD hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub hostname: String,
    pub port: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    WaitToStart,
    PrepareNextDns,
    ResolveNextIpPort,
    ConnectControl,
    ConnectMidi,
    AllConnected,
    SendCkShort,
    WaitSendCkShort,
    SendCkLong,
    WaitSendCkLong,
    DisconnectBecauseCkTimeout,
    DisconnectControl,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientEvent {
    Started,
    NextReady,
    Resolved,
    Connected,
    ConnectFailed,
    ConnectListExhausted,
    SendCk,
    WaitSendCk,
    LatencyMeasured,
    Timeout,
    Connect,
}

/// The connection table: `(state, event) -> state`. Anything not listed is
/// ignored with a debug log.
fn transition(state: ClientState, event: ClientEvent) -> Option<ClientState> {
    use ClientEvent as E;
    use ClientState as S;
    match (state, event) {
        (S::WaitToStart, E::Started) => Some(S::PrepareNextDns),
        (S::PrepareNextDns, E::NextReady) => Some(S::ResolveNextIpPort),
        (S::PrepareNextDns, E::ConnectListExhausted) => Some(S::Error),
        (S::ResolveNextIpPort, E::Resolved) => Some(S::ConnectControl),
        (S::ResolveNextIpPort, E::ConnectListExhausted) => Some(S::PrepareNextDns),
        (S::ConnectControl, E::Connected) => Some(S::ConnectMidi),
        (S::ConnectControl, E::ConnectFailed) => Some(S::ResolveNextIpPort),
        (S::ConnectMidi, E::Connected) => Some(S::AllConnected),
        (S::ConnectMidi, E::ConnectFailed) => Some(S::DisconnectControl),
        (S::DisconnectControl, E::ConnectFailed) => Some(S::ResolveNextIpPort),
        (S::AllConnected, E::SendCk) => Some(S::SendCkShort),
        (S::SendCkShort, E::WaitSendCk) => Some(S::WaitSendCkShort),
        (S::SendCkShort, E::LatencyMeasured) => Some(S::WaitSendCkLong),
        (S::SendCkShort, E::Timeout) => Some(S::DisconnectBecauseCkTimeout),
        (S::WaitSendCkShort, E::SendCk) => Some(S::SendCkShort),
        (S::SendCkLong, E::WaitSendCk) => Some(S::WaitSendCkLong),
        (S::SendCkLong, E::Timeout) => Some(S::DisconnectBecauseCkTimeout),
        (S::WaitSendCkLong, E::SendCk) => Some(S::SendCkLong),
        // A BY or a socket failure mid-session drops us into the
        // reconnect path.
        (S::AllConnected, E::ConnectFailed)
        | (S::SendCkShort, E::ConnectFailed)
        | (S::WaitSendCkShort, E::ConnectFailed)
        | (S::SendCkLong, E::ConnectFailed)
        | (S::WaitSendCkLong, E::ConnectFailed) => Some(S::Error),
        (S::DisconnectBecauseCkTimeout, E::ConnectFailed) => Some(S::Error),
        (S::Error, E::Connect) => Some(S::PrepareNextDns),
        _ => None,
    }
}

enum ClientCommand {
    AddServerAddresses(Vec<ServerAddress>),
    SendMidi(Bytes),
    Shutdown,
}

struct ClientSignals {
    status_change_event: Signal<PeerStatus>,
    midi_event: Signal<Bytes>,
    ck_event: Signal<f32>,
}

/// Handle for one client session. Dropping it tears the session down with a
/// best-effort goodbye.
pub struct RtpMidiClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    signals: Arc<ClientSignals>,
    status: watch::Receiver<PeerStatus>,
}

impl RtpMidiClient {
    /// Creates the client and its driver task. The session starts dialing
    /// once the first server address is added.
    pub fn new(name: impl Into<String>, params: ClientParams) -> Self {
        let name = name.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PeerStatus::NotConnected);
        let signals = Arc::new(ClientSignals {
            status_change_event: Signal::new(),
            midi_event: Signal::new(),
            ck_event: Signal::new(),
        });

        let driver = ClientDriver {
            name: name.clone(),
            params,
            state: ClientState::WaitToStart,
            peer: RtpPeer::new(name),
            known: Vec::new(),
            pending: Vec::new(),
            resolve_endpoint: None,
            resolved: None,
            resolve_index: 0,
            control_address: None,
            midi_address: None,
            control: None,
            midi: None,
            local_base_port: 0,
            timer: None,
            ck_count: 0,
            fsm_queue: VecDeque::new(),
            command_rx,
            signals: Arc::clone(&signals),
            status_tx,
        };
        tokio::spawn(driver.run());

        RtpMidiClient {
            commands,
            signals,
            status,
        }
    }

    pub fn add_server_address(&self, hostname: impl Into<String>, port: impl Into<String>) {
        self.add_server_addresses(vec![ServerAddress {
            hostname: hostname.into(),
            port: port.into(),
        }]);
    }

    pub fn add_server_addresses(&self, addresses: Vec<ServerAddress>) {
        let _ = self
            .commands
            .send(ClientCommand::AddServerAddresses(addresses));
    }

    /// Queue raw MIDI commands for the peer. Dropped silently while the
    /// session is not connected.
    pub fn send_midi(&self, commands: &[u8]) {
        let _ = self
            .commands
            .send(ClientCommand::SendMidi(Bytes::copy_from_slice(commands)));
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.borrow()
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PeerStatus) + Send + Sync + 'static,
    {
        self.signals.status_change_event.connect(callback)
    }

    pub fn on_midi<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.signals.midi_event.connect(callback)
    }

    pub fn on_clock_sync<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&f32) + Send + Sync + 'static,
    {
        self.signals.ck_event.connect(callback)
    }

    /// Ends the session with a goodbye on both connected ports.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ClientCommand::Shutdown);
    }
}

impl Drop for RtpMidiClient {
    fn drop(&mut self) {
        let _ = self.commands.send(ClientCommand::Shutdown);
    }
}

struct ClientDriver {
    name: String,
    params: ClientParams,
    state: ClientState,
    peer: RtpPeer,
    /// Every endpoint ever added.
    known: Vec<ServerAddress>,
    /// Endpoints left to try in this attempt; refilled from `known` on each
    /// pass through the error state.
    pending: Vec<ServerAddress>,
    resolve_endpoint: Option<ServerAddress>,
    resolved: Option<Vec<SocketAddr>>,
    resolve_index: usize,
    control_address: Option<SocketAddr>,
    midi_address: Option<SocketAddr>,
    control: Option<UdpEndpoint>,
    midi: Option<UdpEndpoint>,
    local_base_port: u16,
    timer: Option<(Instant, ClientEvent)>,
    ck_count: u32,
    fsm_queue: VecDeque<ClientEvent>,
    command_rx: mpsc::UnboundedReceiver<ClientCommand>,
    signals: Arc<ClientSignals>,
    status_tx: watch::Sender<PeerStatus>,
}

async fn recv_opt(
    endpoint: Option<UdpEndpoint>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match endpoint {
        Some(endpoint) => endpoint.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ClientDriver {
    async fn run(mut self) {
        let mut control_buf = [0u8; MAX_UDP_PACKET_SIZE];
        let mut midi_buf = [0u8; MAX_UDP_PACKET_SIZE];
        loop {
            let deadline = self.timer.as_ref().map(|(at, _)| *at);
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                result = recv_opt(self.control.clone(), &mut control_buf) => {
                    match result {
                        Ok((len, _from)) => {
                            self.peer.data_ready(&control_buf[..len], PeerPort::Control);
                        }
                        Err(e) => {
                            error!("Error receiving on control socket: {}", e);
                            self.control = None;
                            self.peer.set_network_error();
                        }
                    }
                    self.pump().await;
                }
                result = recv_opt(self.midi.clone(), &mut midi_buf) => {
                    match result {
                        Ok((len, _from)) => {
                            self.peer.data_ready(&midi_buf[..len], PeerPort::Midi);
                        }
                        Err(e) => {
                            error!("Error receiving on midi socket: {}", e);
                            self.midi = None;
                            self.peer.set_network_error();
                        }
                    }
                    self.pump().await;
                }
                _ = sleep_opt(deadline) => {
                    if let Some((_, event)) = self.timer.take() {
                        self.fsm_queue.push_back(event);
                        self.pump().await;
                    }
                }
            }
        }
        debug!("Client '{}' driver finished", self.name);
    }

    /// Returns true when the driver should stop.
    async fn handle_command(&mut self, command: ClientCommand) -> bool {
        match command {
            ClientCommand::AddServerAddresses(addresses) => {
                for address in addresses {
                    self.known.push(address.clone());
                    self.pending.push(address);
                }
                if self.state == ClientState::WaitToStart {
                    self.fsm_queue.push_back(ClientEvent::Started);
                }
                self.pump().await;
                false
            }
            ClientCommand::SendMidi(commands) => {
                self.peer.send_midi(&commands);
                self.pump().await;
                false
            }
            ClientCommand::Shutdown => {
                info!("Client '{}' shutting down", self.name);
                self.peer.disconnect();
                self.flush().await;
                true
            }
        }
    }

    /// Drains peer actions and then works the state-machine queue until both
    /// are empty.
    async fn pump(&mut self) {
        loop {
            self.flush().await;
            let Some(event) = self.fsm_queue.pop_front() else {
                break;
            };
            self.step(event).await;
        }
    }

    /// Sends queued peer transmissions and forwards peer notifications,
    /// translating them into state-machine events where the current state
    /// cares.
    async fn flush(&mut self) {
        while let Some(event) = self.peer.poll_event() {
            match event {
                PeerEvent::Transmit { port, data } => self.transmit(port, &data).await,
                PeerEvent::StatusChanged(status) => {
                    self.status_tx.send_replace(status);
                    self.signals.status_change_event.emit(&status);
                    if let Some(event) = self.map_status(status) {
                        self.fsm_queue.push_back(event);
                    }
                }
                PeerEvent::MidiReceived(data) => self.signals.midi_event.emit(&data),
                PeerEvent::ClockSync { latency_ms } => {
                    self.signals.ck_event.emit(&latency_ms);
                    if let Some(event) = self.map_clock_sync() {
                        self.fsm_queue.push_back(event);
                    }
                }
            }
        }
    }

    async fn transmit(&mut self, port: PeerPort, data: &[u8]) {
        let (endpoint, target) = match port {
            PeerPort::Control => (self.control.clone(), self.control_address),
            PeerPort::Midi => (self.midi.clone(), self.midi_address),
        };
        let (Some(endpoint), Some(target)) = (endpoint, target) else {
            debug!("No open {:?} socket, dropping outbound packet", port);
            return;
        };
        if let Err(e) = endpoint.send_to(data, target).await {
            error!("Error sending to {}: {}", target, e);
            self.peer.set_network_error();
        }
    }

    fn map_status(&self, status: PeerStatus) -> Option<ClientEvent> {
        match self.state {
            ClientState::ConnectControl => {
                if status == PeerStatus::ControlConnected {
                    Some(ClientEvent::Connected)
                } else if status.is_disconnected() {
                    Some(ClientEvent::ConnectFailed)
                } else {
                    None
                }
            }
            ClientState::ConnectMidi => {
                if status == PeerStatus::Connected {
                    Some(ClientEvent::Connected)
                } else if status.is_disconnected() {
                    Some(ClientEvent::ConnectFailed)
                } else {
                    None
                }
            }
            ClientState::AllConnected
            | ClientState::SendCkShort
            | ClientState::WaitSendCkShort
            | ClientState::SendCkLong
            | ClientState::WaitSendCkLong => {
                if status.is_disconnected() {
                    Some(ClientEvent::ConnectFailed)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn map_clock_sync(&mut self) -> Option<ClientEvent> {
        match self.state {
            ClientState::SendCkShort => {
                self.timer = None;
                if self.ck_count < CK_SHORT_COUNT {
                    Some(ClientEvent::WaitSendCk)
                } else {
                    Some(ClientEvent::LatencyMeasured)
                }
            }
            ClientState::SendCkLong => {
                self.timer = None;
                Some(ClientEvent::WaitSendCk)
            }
            _ => {
                debug!("Clock sync response outside an exchange, ignoring");
                None
            }
        }
    }

    async fn step(&mut self, event: ClientEvent) {
        let Some(next) = transition(self.state, event) else {
            debug!("No transition from {:?} on {:?}", self.state, event);
            return;
        };
        trace!("Client state {:?} -> {:?} on {:?}", self.state, next, event);
        self.state = next;
        if let Some(follow_up) = self.enter_state().await {
            self.fsm_queue.push_front(follow_up);
        }
    }

    fn arm_timer(&mut self, delay: Duration, event: ClientEvent) {
        self.timer = Some((Instant::now() + delay, event));
    }

    async fn enter_state(&mut self) -> Option<ClientEvent> {
        match self.state {
            ClientState::WaitToStart => None,

            ClientState::PrepareNextDns => {
                self.resolved = None;
                if self.pending.is_empty() {
                    Some(ClientEvent::ConnectListExhausted)
                } else {
                    self.resolve_endpoint = Some(self.pending.remove(0));
                    Some(ClientEvent::NextReady)
                }
            }

            ClientState::ResolveNextIpPort => {
                if self.resolved.is_none() {
                    let Some(endpoint) = self.resolve_endpoint.clone() else {
                        return Some(ClientEvent::ConnectListExhausted);
                    };
                    match address::resolve(&endpoint.hostname, &endpoint.port).await {
                        Ok(addresses) => {
                            self.resolved = Some(addresses);
                            self.resolve_index = 0;
                        }
                        Err(e) => {
                            error!(
                                "Could not resolve {}:{}: {}",
                                endpoint.hostname, endpoint.port, e
                            );
                            return Some(ClientEvent::ConnectListExhausted);
                        }
                    }
                } else {
                    self.resolve_index += 1;
                }
                let address = self
                    .resolved
                    .as_ref()
                    .and_then(|addresses| addresses.get(self.resolve_index).copied());
                match address {
                    Some(address) => {
                        self.control_address = Some(address);
                        self.midi_address =
                            Some(address::with_port(address, address.port() + 1));
                        debug!("Trying to connect to {}", address);
                        Some(ClientEvent::Resolved)
                    }
                    None => {
                        self.resolved = None;
                        Some(ClientEvent::ConnectListExhausted)
                    }
                }
            }

            ClientState::ConnectControl => {
                // A NO or a network error on a previous candidate leaves the
                // protocol state terminal; each dial starts from scratch.
                if self.peer.status().is_disconnected() {
                    self.peer = RtpPeer::new(self.name.clone());
                }
                match UdpEndpoint::bind(0).await {
                    Ok(endpoint) => {
                        self.local_base_port = endpoint.port().unwrap_or(0);
                        self.peer.local_address = endpoint.local_addr().ok();
                        self.control = Some(endpoint);
                    }
                    Err(e) => {
                        error!("Could not open control socket: {}", e);
                        return Some(ClientEvent::ConnectFailed);
                    }
                }
                self.arm_timer(self.params.connect_timeout, ClientEvent::ConnectFailed);
                self.peer.connect_to(PeerPort::Control);
                None
            }

            ClientState::ConnectMidi => {
                self.timer = None;
                match UdpEndpoint::bind(self.local_base_port + 1).await {
                    Ok(endpoint) => self.midi = Some(endpoint),
                    Err(e) => {
                        error!(
                            "Could not open midi socket on port {}: {}",
                            self.local_base_port + 1,
                            e
                        );
                        return Some(ClientEvent::ConnectFailed);
                    }
                }
                self.arm_timer(MIDI_CONNECT_TIMEOUT, ClientEvent::ConnectFailed);
                self.peer.connect_to(PeerPort::Midi);
                None
            }

            ClientState::AllConnected => {
                self.timer = None;
                info!(
                    "Connected to '{}' at {}",
                    self.peer.remote_name,
                    self.control_address
                        .map(|address| address.to_string())
                        .unwrap_or_else(|| "?".to_string())
                );
                self.peer.remote_address = self.control_address;
                self.peer.remote_base_port =
                    self.control_address.map(|address| address.port()).unwrap_or(0);
                self.ck_count = 0;
                Some(ClientEvent::SendCk)
            }

            ClientState::SendCkShort | ClientState::SendCkLong => {
                self.ck_count += 1;
                self.peer.send_ck0();
                self.arm_timer(self.params.connect_timeout, ClientEvent::Timeout);
                None
            }

            ClientState::WaitSendCkShort => {
                self.arm_timer(self.params.ck_short_period, ClientEvent::SendCk);
                None
            }

            ClientState::WaitSendCkLong => {
                self.arm_timer(self.params.ck_long_period, ClientEvent::SendCk);
                None
            }

            ClientState::DisconnectBecauseCkTimeout => {
                info!("Disconnecting, clock sync timed out");
                self.timer = None;
                self.peer.disconnect_because(DisconnectReason::CkTimeout);
                Some(ClientEvent::ConnectFailed)
            }

            ClientState::DisconnectControl => {
                self.timer = None;
                self.peer.send_goodbye(PeerPort::Control);
                self.flush().await;
                self.control = None;
                self.midi = None;
                Some(ClientEvent::ConnectFailed)
            }

            ClientState::Error => {
                self.timer = None;
                self.peer.disconnect();
                self.flush().await;
                self.control = None;
                self.midi = None;
                self.control_address = None;
                self.midi_address = None;
                self.resolved = None;
                self.peer = RtpPeer::new(self.name.clone());
                self.pending = self.known.clone();
                error!(
                    "Can't connect or disconnected; trying again in {:?}",
                    self.params.reconnect_timeout
                );
                self.arm_timer(self.params.reconnect_timeout, ClientEvent::Connect);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_connect_path() {
        use ClientEvent as E;
        use ClientState as S;
        assert_eq!(transition(S::WaitToStart, E::Started), Some(S::PrepareNextDns));
        assert_eq!(
            transition(S::PrepareNextDns, E::NextReady),
            Some(S::ResolveNextIpPort)
        );
        assert_eq!(
            transition(S::ResolveNextIpPort, E::Resolved),
            Some(S::ConnectControl)
        );
        assert_eq!(transition(S::ConnectControl, E::Connected), Some(S::ConnectMidi));
        assert_eq!(transition(S::ConnectMidi, E::Connected), Some(S::AllConnected));
        assert_eq!(transition(S::AllConnected, E::SendCk), Some(S::SendCkShort));
    }

    #[test]
    fn test_transition_table_failure_paths() {
        use ClientEvent as E;
        use ClientState as S;
        assert_eq!(
            transition(S::ConnectControl, E::ConnectFailed),
            Some(S::ResolveNextIpPort)
        );
        assert_eq!(
            transition(S::ConnectMidi, E::ConnectFailed),
            Some(S::DisconnectControl)
        );
        assert_eq!(
            transition(S::DisconnectControl, E::ConnectFailed),
            Some(S::ResolveNextIpPort)
        );
        assert_eq!(
            transition(S::ResolveNextIpPort, E::ConnectListExhausted),
            Some(S::PrepareNextDns)
        );
        assert_eq!(
            transition(S::PrepareNextDns, E::ConnectListExhausted),
            Some(S::Error)
        );
        assert_eq!(transition(S::Error, E::Connect), Some(S::PrepareNextDns));
    }

    #[test]
    fn test_transition_table_clock_sync_cycle() {
        use ClientEvent as E;
        use ClientState as S;
        assert_eq!(transition(S::SendCkShort, E::WaitSendCk), Some(S::WaitSendCkShort));
        assert_eq!(
            transition(S::SendCkShort, E::LatencyMeasured),
            Some(S::WaitSendCkLong)
        );
        assert_eq!(transition(S::WaitSendCkShort, E::SendCk), Some(S::SendCkShort));
        assert_eq!(transition(S::WaitSendCkLong, E::SendCk), Some(S::SendCkLong));
        assert_eq!(transition(S::SendCkLong, E::WaitSendCk), Some(S::WaitSendCkLong));
        assert_eq!(
            transition(S::SendCkShort, E::Timeout),
            Some(S::DisconnectBecauseCkTimeout)
        );
        assert_eq!(
            transition(S::DisconnectBecauseCkTimeout, E::ConnectFailed),
            Some(S::Error)
        );
    }

    #[test]
    fn test_transition_table_rejects_unknown() {
        use ClientEvent as E;
        use ClientState as S;
        assert_eq!(transition(S::WaitToStart, E::SendCk), None);
        assert_eq!(transition(S::AllConnected, E::Started), None);
        assert_eq!(transition(S::Error, E::Timeout), None);
    }

    #[test]
    fn test_default_params() {
        let params = ClientParams::default();
        assert_eq!(params.connect_timeout, Duration::from_secs(1));
        assert_eq!(params.ck_short_period, Duration::from_millis(1500));
        assert_eq!(params.ck_long_period, Duration::from_secs(10));
        assert_eq!(params.reconnect_timeout, Duration::from_secs(5));
    }
}
