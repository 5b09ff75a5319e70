//! Stream + datagram driver sharing one port.
//!
//! The host accepts stream connections and assigns each a channel id over the
//! stream. The client echoes that id from its datagram socket until the host
//! acknowledges it on the stream; from then on datagrams from that address
//! belong to the channel. The stream carries length-prefixed reliable frames,
//! datagrams carry one unreliable message each.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::net::{
    Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket,
};
use std::time::Instant;

use super::driver::{
    ChannelId, ConnectionInfo, Delivery, Driver, DriverEvent, DriverKind, EventQueue,
    TransportError,
};
use super::framing::{
    ACK_CHANNEL_ID_LEN, CONTROL_FRAME_MAX, ControlFrame, FrameTooLarge, LENGTH_PREFIX_SIZE,
    MAX_RELIABLE_PAYLOAD, PendingReceive, ReadOutcome, SET_CHANNEL_ID_LEN, encode_reliable,
    read_exact_available,
};
use super::metrics::IoMetrics;
use crate::config::TransportConfig;

/// Largest payload a single IPv4 UDP datagram can carry.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507;
const RECV_BUFFER_SIZE: usize = 65_536;

enum WriteOutcome {
    Written,
    WouldBlock,
    Failed(io::Error),
}

/// Writes all of `bytes`, giving up after `retry_limit` short or blocked writes.
fn write_bounded(stream: &mut TcpStream, bytes: &[u8], retry_limit: u32) -> WriteOutcome {
    let mut written = 0;
    let mut retries = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => return WriteOutcome::Failed(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                written += n;
                if written < bytes.len() {
                    retries += 1;
                    if retries > retry_limit {
                        return WriteOutcome::WouldBlock;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries > retry_limit {
                    return WriteOutcome::WouldBlock;
                }
                std::thread::yield_now();
            }
            Err(e) => return WriteOutcome::Failed(e),
        }
    }
    WriteOutcome::Written
}

struct Peer {
    channel: ChannelId,
    stream: TcpStream,
    addr: SocketAddr,
    datagram_addr: Option<SocketAddr>,
    handshake_done: bool,
    accepted_at: Instant,
    receive: PendingReceive,
    send_buffer: Vec<u8>,
    metrics: IoMetrics,
}

impl Peer {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            channel: self.channel,
            address: self.addr.to_string(),
            datagram_address: self.datagram_addr.map(|addr| addr.to_string()),
            valid: self.handshake_done,
            metrics: self.metrics,
        }
    }
}

struct Host {
    listener: TcpListener,
    socket: UdpSocket,
    local_addr: SocketAddr,
    max_connections: usize,
    next_channel: u16,
    peers: BTreeMap<ChannelId, Peer>,
    by_datagram_addr: HashMap<SocketAddr, ChannelId>,
    recv_buffer: Box<[u8]>,
    stray_datagrams: u64,
}

impl Host {
    fn bind(port: u16, max_connections: usize) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_addr.port()))?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            listener,
            socket,
            local_addr,
            max_connections,
            next_channel: 1,
            peers: BTreeMap::new(),
            by_datagram_addr: HashMap::new(),
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            stray_datagrams: 0,
        })
    }

    fn allocate_channel(&mut self) -> Option<ChannelId> {
        for _ in 0..u16::MAX {
            let candidate = ChannelId(self.next_channel);
            self.next_channel = self.next_channel.wrapping_add(1).max(1);
            if !self.peers.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn tick(&mut self, events: &mut EventQueue, totals: &mut IoMetrics, config: &TransportConfig) {
        self.accept(config);
        self.receive_datagrams(events, totals, config);
        self.receive_streams(events, totals);
        self.expire_handshakes(events, config);
    }

    fn accept(&mut self, config: &TransportConfig) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            };

            if self.peers.len() >= self.max_connections {
                log::warn!("refusing connection from {}: server full", addr);
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
            if let Err(e) = stream
                .set_nonblocking(true)
                .and_then(|_| stream.set_nodelay(true))
            {
                log::warn!("failed to configure stream from {}: {}", addr, e);
                continue;
            }
            let Some(channel) = self.allocate_channel() else {
                log::warn!("refusing connection from {}: no free channel ids", addr);
                continue;
            };

            let mut peer = Peer {
                channel,
                stream,
                addr,
                datagram_addr: None,
                handshake_done: false,
                accepted_at: Instant::now(),
                receive: PendingReceive::new(config.receive_capacity),
                send_buffer: Vec::new(),
                metrics: IoMetrics::default(),
            };

            let assign = ControlFrame::SetChannelId(channel).to_vec();
            match write_bounded(&mut peer.stream, &assign, config.send_retry_limit) {
                WriteOutcome::Written => {
                    log::debug!("accepted {} as channel {}", addr, channel);
                    self.peers.insert(channel, peer);
                }
                WriteOutcome::WouldBlock => {
                    log::warn!("could not assign channel to {}: stream blocked", addr);
                }
                WriteOutcome::Failed(e) => {
                    log::warn!("could not assign channel to {}: {}", addr, e);
                }
            }
        }
    }

    fn receive_datagrams(
        &mut self,
        events: &mut EventQueue,
        totals: &mut IoMetrics,
        config: &TransportConfig,
    ) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("datagram receive failed: {}", e);
                    break;
                }
            };

            if let Some(&channel) = self.by_datagram_addr.get(&from) {
                // Correlation retries that were in flight when the ack went out.
                if ControlFrame::parse(&self.recv_buffer[..len])
                    == Some(ControlFrame::SetChannelId(channel))
                {
                    log::trace!("ignoring late SetChannelID retry from {}", channel);
                    continue;
                }
                if let Some(peer) = self.peers.get_mut(&channel) {
                    peer.metrics.record_received(Delivery::Unreliable, len);
                }
                totals.record_received(Delivery::Unreliable, len);
                events.push(DriverEvent::Message {
                    channel,
                    delivery: Delivery::Unreliable,
                    payload: self.recv_buffer[..len].to_vec(),
                });
                continue;
            }

            match ControlFrame::parse(&self.recv_buffer[..len]) {
                Some(ControlFrame::SetChannelId(channel)) => {
                    self.correlate(channel, from, events, config);
                }
                _ if len <= CONTROL_FRAME_MAX => {
                    self.stray_datagrams += 1;
                    log::trace!("dropping malformed control datagram from {}", from);
                }
                _ => {
                    self.stray_datagrams += 1;
                    log::trace!("dropping {} byte datagram from unknown {}", len, from);
                }
            }
        }
    }

    /// Binds `from` as the datagram endpoint of `channel`.
    ///
    /// The first matching datagram wins; replays for a channel that is already
    /// bound are ignored so the endpoint never moves and no second ack is
    /// written into the framed stream.
    fn correlate(
        &mut self,
        channel: ChannelId,
        from: SocketAddr,
        events: &mut EventQueue,
        config: &TransportConfig,
    ) {
        let Some(peer) = self.peers.get_mut(&channel) else {
            log::debug!("SetChannelID for unknown channel {} from {}", channel, from);
            return;
        };
        if let Some(bound) = peer.datagram_addr {
            log::debug!(
                "ignoring SetChannelID replay for {} from {} (bound to {})",
                channel,
                from,
                bound
            );
            return;
        }

        let ack = ControlFrame::AckChannelId.to_vec();
        match write_bounded(&mut peer.stream, &ack, config.send_retry_limit) {
            WriteOutcome::Written => {
                peer.datagram_addr = Some(from);
                peer.handshake_done = true;
                self.by_datagram_addr.insert(from, channel);
                log::info!(
                    "channel {} connected from {} (datagrams from {})",
                    channel,
                    peer.addr,
                    from
                );
                events.push(DriverEvent::Connected(channel));
            }
            WriteOutcome::WouldBlock => {
                log::warn!("could not acknowledge channel {}: stream blocked", channel);
                self.drop_peer(channel, events);
            }
            WriteOutcome::Failed(e) => {
                log::warn!("could not acknowledge channel {}: {}", channel, e);
                self.drop_peer(channel, events);
            }
        }
    }

    fn receive_streams(&mut self, events: &mut EventQueue, totals: &mut IoMetrics) {
        let mut closed = Vec::new();

        for (&channel, peer) in self.peers.iter_mut() {
            loop {
                match peer.receive.poll(&mut peer.stream) {
                    Ok(ReadOutcome::Frame(payload)) => {
                        if !peer.handshake_done {
                            log::warn!("channel {} sent data before its handshake", channel);
                            closed.push(channel);
                            break;
                        }
                        let wire_len = payload.len() + LENGTH_PREFIX_SIZE;
                        peer.metrics.record_received(Delivery::Reliable, wire_len);
                        totals.record_received(Delivery::Reliable, wire_len);
                        events.push(DriverEvent::Message {
                            channel,
                            delivery: Delivery::Reliable,
                            payload,
                        });
                    }
                    Ok(ReadOutcome::Pending) => break,
                    Ok(ReadOutcome::Closed) => {
                        log::info!("channel {} closed by remote", channel);
                        closed.push(channel);
                        break;
                    }
                    Ok(ReadOutcome::Oversized(len)) => {
                        log::warn!(
                            "channel {} declared a {} byte frame (capacity {})",
                            channel,
                            len,
                            peer.receive.capacity()
                        );
                        if peer.handshake_done {
                            events.push(DriverEvent::InvalidMessage(channel));
                        }
                        closed.push(channel);
                        break;
                    }
                    Err(e) => {
                        log::warn!("read from channel {} failed: {}", channel, e);
                        closed.push(channel);
                        break;
                    }
                }
            }
        }

        for channel in closed {
            self.drop_peer(channel, events);
        }
    }

    fn expire_handshakes(&mut self, events: &mut EventQueue, config: &TransportConfig) {
        let timeout = config.handshake_timeout();
        let expired: Vec<ChannelId> = self
            .peers
            .values()
            .filter(|peer| !peer.handshake_done && peer.accepted_at.elapsed() > timeout)
            .map(|peer| peer.channel)
            .collect();

        for channel in expired {
            log::warn!(
                "channel {} did not complete its handshake within {:?}",
                channel,
                timeout
            );
            self.drop_peer(channel, events);
        }
    }

    fn drop_peer(&mut self, channel: ChannelId, events: &mut EventQueue) {
        let Some(peer) = self.peers.remove(&channel) else {
            return;
        };
        if let Some(addr) = peer.datagram_addr {
            self.by_datagram_addr.remove(&addr);
        }
        let _ = peer.stream.shutdown(Shutdown::Both);
        if peer.handshake_done {
            events.push(DriverEvent::Disconnected(channel));
        }
    }

    fn send_reliable(
        &mut self,
        channel: ChannelId,
        payload: &[u8],
        events: &mut EventQueue,
        totals: &mut IoMetrics,
        config: &TransportConfig,
    ) -> Result<(), TransportError> {
        let peer = match self.peers.get_mut(&channel) {
            Some(peer) if peer.handshake_done => peer,
            _ => return Err(TransportError::NotConnected(channel)),
        };
        encode_reliable(payload, &mut peer.send_buffer)?;

        let outcome = write_bounded(&mut peer.stream, &peer.send_buffer, config.send_retry_limit);
        let wire_len = peer.send_buffer.len();
        match outcome {
            WriteOutcome::Written => {
                peer.metrics.record_sent(Delivery::Reliable, wire_len);
                totals.record_sent(Delivery::Reliable, wire_len);
                Ok(())
            }
            WriteOutcome::WouldBlock => {
                log::warn!("reliable channel {} is not draining, dropping it", channel);
                events.push(DriverEvent::ReliableSendWouldBlock(channel));
                self.drop_peer(channel, events);
                Err(TransportError::WouldBlock(channel))
            }
            WriteOutcome::Failed(e) => {
                log::warn!("reliable send to channel {} failed: {}", channel, e);
                self.drop_peer(channel, events);
                Err(e.into())
            }
        }
    }

    fn send_unreliable(
        &mut self,
        channel: ChannelId,
        payload: &[u8],
        events: &mut EventQueue,
        totals: &mut IoMetrics,
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(TransportError::DatagramTooLarge(payload.len()));
        }
        let Some(peer) = self.peers.get_mut(&channel) else {
            return Err(TransportError::NotConnected(channel));
        };
        let Some(addr) = peer.datagram_addr.filter(|_| peer.handshake_done) else {
            return Err(TransportError::NotConnected(channel));
        };

        match self.socket.send_to(payload, addr) {
            Ok(sent) => {
                peer.metrics.record_sent(Delivery::Unreliable, sent);
                totals.record_sent(Delivery::Unreliable, sent);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("datagram to channel {} dropped: socket busy", channel);
                Ok(())
            }
            Err(e) => {
                log::warn!("datagram to channel {} failed: {}", channel, e);
                self.drop_peer(channel, events);
                Err(e.into())
            }
        }
    }

    fn close_all(&mut self, events: &mut EventQueue) {
        let channels: Vec<ChannelId> = self.peers.keys().copied().collect();
        for channel in channels {
            self.drop_peer(channel, events);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingChannel,
    Correlating {
        channel: ChannelId,
        last_sent: Option<Instant>,
    },
    Established(ChannelId),
}

struct Outbound {
    stream: TcpStream,
    socket: UdpSocket,
    server_addr: SocketAddr,
    phase: Phase,
    started: Instant,
    receive: PendingReceive,
    send_buffer: Vec<u8>,
    recv_buffer: Box<[u8]>,
    metrics: IoMetrics,
}

impl Outbound {
    fn open(server_addr: SocketAddr, config: &TransportConfig) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&server_addr, config.connect_timeout())?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let bind_addr: SocketAddr = match server_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(server_addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            stream,
            socket,
            server_addr,
            phase: Phase::AwaitingChannel,
            started: Instant::now(),
            receive: PendingReceive::new(config.receive_capacity),
            send_buffer: Vec::new(),
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
            metrics: IoMetrics::default(),
        })
    }

    fn channel(&self) -> Option<ChannelId> {
        match self.phase {
            Phase::AwaitingChannel => None,
            Phase::Correlating { channel, .. } | Phase::Established(channel) => Some(channel),
        }
    }

    fn established(&self) -> Option<ChannelId> {
        match self.phase {
            Phase::Established(channel) => Some(channel),
            _ => None,
        }
    }

    fn info(&self) -> Option<ConnectionInfo> {
        let channel = self.channel()?;
        let established = self.established().is_some();
        Some(ConnectionInfo {
            channel,
            address: self.server_addr.to_string(),
            datagram_address: established.then(|| self.server_addr.to_string()),
            valid: established,
            metrics: self.metrics,
        })
    }

    /// Advances the handshake and drains inbound traffic. An `Err` carries the
    /// reason the connection has to be torn down.
    fn tick(
        &mut self,
        events: &mut EventQueue,
        totals: &mut IoMetrics,
        config: &TransportConfig,
    ) -> Result<(), String> {
        if self.phase == Phase::AwaitingChannel {
            match read_exact_available(&mut self.stream, SET_CHANNEL_ID_LEN) {
                Ok(ReadOutcome::Frame(bytes)) => match ControlFrame::parse(&bytes) {
                    Some(ControlFrame::SetChannelId(channel)) => {
                        log::debug!("server assigned channel {}", channel);
                        self.phase = Phase::Correlating {
                            channel,
                            last_sent: None,
                        };
                    }
                    _ => return Err(format!("malformed channel assignment {:?}", bytes)),
                },
                Ok(ReadOutcome::Pending) => {}
                Ok(_) => return Err("server closed the connection".to_string()),
                Err(e) => return Err(format!("stream read failed: {}", e)),
            }
        }

        if let Phase::Correlating { channel, last_sent } = self.phase {
            let due = last_sent.is_none_or(|at| at.elapsed() >= config.handshake_retry());
            if due {
                let frame = ControlFrame::SetChannelId(channel).to_vec();
                match self.socket.send(&frame) {
                    Ok(_) => log::trace!("sent SetChannelID {} datagram", channel),
                    Err(e) => log::debug!("SetChannelID datagram failed: {}", e),
                }
                self.phase = Phase::Correlating {
                    channel,
                    last_sent: Some(Instant::now()),
                };
            }

            match read_exact_available(&mut self.stream, ACK_CHANNEL_ID_LEN) {
                Ok(ReadOutcome::Frame(bytes)) => match ControlFrame::parse(&bytes) {
                    Some(ControlFrame::AckChannelId) => {
                        log::info!("connected to {} as channel {}", self.server_addr, channel);
                        self.phase = Phase::Established(channel);
                        events.push(DriverEvent::Connected(channel));
                    }
                    _ => return Err(format!("malformed channel ack {:?}", bytes)),
                },
                Ok(ReadOutcome::Pending) => {}
                Ok(_) => return Err("server closed the connection".to_string()),
                Err(e) => return Err(format!("stream read failed: {}", e)),
            }
        }

        match self.phase {
            Phase::Established(channel) => {
                self.receive_stream(channel, events, totals)?;
                self.receive_datagrams(Some(channel), events, totals);
            }
            _ => {
                self.receive_datagrams(None, events, totals);
                if self.started.elapsed() > config.handshake_timeout() {
                    return Err(format!(
                        "handshake did not complete within {:?}",
                        config.handshake_timeout()
                    ));
                }
            }
        }

        Ok(())
    }

    fn receive_stream(
        &mut self,
        channel: ChannelId,
        events: &mut EventQueue,
        totals: &mut IoMetrics,
    ) -> Result<(), String> {
        loop {
            match self.receive.poll(&mut self.stream) {
                Ok(ReadOutcome::Frame(payload)) => {
                    let wire_len = payload.len() + LENGTH_PREFIX_SIZE;
                    self.metrics.record_received(Delivery::Reliable, wire_len);
                    totals.record_received(Delivery::Reliable, wire_len);
                    events.push(DriverEvent::Message {
                        channel,
                        delivery: Delivery::Reliable,
                        payload,
                    });
                }
                Ok(ReadOutcome::Pending) => return Ok(()),
                Ok(ReadOutcome::Closed) => return Err("server closed the connection".to_string()),
                Ok(ReadOutcome::Oversized(len)) => {
                    events.push(DriverEvent::InvalidMessage(channel));
                    return Err(format!("server declared a {} byte frame", len));
                }
                Err(e) => return Err(format!("stream read failed: {}", e)),
            }
        }
    }

    /// Before the handshake completes every datagram is dropped.
    fn receive_datagrams(
        &mut self,
        channel: Option<ChannelId>,
        events: &mut EventQueue,
        totals: &mut IoMetrics,
    ) {
        loop {
            let len = match self.socket.recv(&mut self.recv_buffer) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::trace!("datagram receive failed: {}", e);
                    break;
                }
            };

            let Some(channel) = channel else {
                log::trace!("dropping {} byte datagram before handshake", len);
                continue;
            };
            self.metrics.record_received(Delivery::Unreliable, len);
            totals.record_received(Delivery::Unreliable, len);
            events.push(DriverEvent::Message {
                channel,
                delivery: Delivery::Unreliable,
                payload: self.recv_buffer[..len].to_vec(),
            });
        }
    }

    fn send_reliable(
        &mut self,
        payload: &[u8],
        totals: &mut IoMetrics,
        config: &TransportConfig,
    ) -> WriteOutcome {
        if let Err(e) = encode_reliable(payload, &mut self.send_buffer) {
            return WriteOutcome::Failed(io::Error::new(io::ErrorKind::InvalidInput, e));
        }

        let outcome = write_bounded(&mut self.stream, &self.send_buffer, config.send_retry_limit);
        if let WriteOutcome::Written = outcome {
            let wire_len = self.send_buffer.len();
            self.metrics.record_sent(Delivery::Reliable, wire_len);
            totals.record_sent(Delivery::Reliable, wire_len);
        }
        outcome
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

enum Role {
    Idle,
    Host(Host),
    Client(Outbound),
}

/// Driver over one stream socket and one datagram socket per endpoint.
///
/// `connect` waits for the stream to open (bounded by the transport's
/// `connect_timeout_ms`); the channel handshake then completes across
/// `tick_client` calls.
pub struct HybridDriver {
    config: TransportConfig,
    role: Role,
    events: EventQueue,
    metrics: IoMetrics,
}

impl HybridDriver {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            role: Role::Idle,
            events: EventQueue::default(),
            metrics: IoMetrics::default(),
        }
    }

    /// Datagrams the host could not attribute to any connection.
    pub fn stray_datagrams(&self) -> u64 {
        match &self.role {
            Role::Host(host) => host.stray_datagrams,
            _ => 0,
        }
    }

    fn close_client(&mut self, reason: String, report_failure: bool) {
        let Role::Client(outbound) = std::mem::replace(&mut self.role, Role::Idle) else {
            return;
        };
        outbound.shutdown();
        match outbound.established() {
            Some(channel) => {
                log::info!("channel {} closed: {}", channel, reason);
                self.events.push(DriverEvent::Disconnected(channel));
            }
            None if report_failure => {
                log::warn!("connection to {} failed: {}", outbound.server_addr, reason);
                self.events.push(DriverEvent::ConnectFailed(reason));
            }
            None => {}
        }
    }
}

impl Driver for HybridDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Hybrid
    }

    fn listen(&mut self, port: u16, max_connections: usize) -> Result<(), TransportError> {
        if !matches!(self.role, Role::Idle) {
            return Err(TransportError::AlreadyActive);
        }
        let host = Host::bind(port, max_connections)?;
        log::info!("listening on {} (max {} connections)", host.local_addr, max_connections);
        self.role = Role::Host(host);
        Ok(())
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if !matches!(self.role, Role::Idle) {
            return Err(TransportError::AlreadyActive);
        }
        let target = format!("{}:{}", host, port);
        let server_addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(target.clone()))?
            .next()
            .ok_or(TransportError::Resolve(target))?;

        log::info!("connecting to {}", server_addr);
        let outbound = Outbound::open(server_addr, &self.config)?;
        self.role = Role::Client(outbound);
        Ok(())
    }

    fn tick_server(&mut self) {
        if let Role::Host(host) = &mut self.role {
            host.tick(&mut self.events, &mut self.metrics, &self.config);
        }
    }

    fn tick_client(&mut self) {
        let Role::Client(outbound) = &mut self.role else {
            return;
        };
        if let Err(reason) = outbound.tick(&mut self.events, &mut self.metrics, &self.config) {
            self.close_client(reason, true);
        }
    }

    fn send_reliable(&mut self, channel: ChannelId, payload: &[u8]) -> Result<(), TransportError> {
        match &mut self.role {
            Role::Host(host) => host.send_reliable(
                channel,
                payload,
                &mut self.events,
                &mut self.metrics,
                &self.config,
            ),
            Role::Client(outbound) => {
                if outbound.established() != Some(channel) {
                    return Err(TransportError::NotConnected(channel));
                }
                if payload.len() > MAX_RELIABLE_PAYLOAD {
                    return Err(FrameTooLarge { len: payload.len() }.into());
                }
                match outbound.send_reliable(payload, &mut self.metrics, &self.config) {
                    WriteOutcome::Written => Ok(()),
                    WriteOutcome::WouldBlock => {
                        log::warn!("reliable channel {} is not draining, dropping it", channel);
                        self.events.push(DriverEvent::ReliableSendWouldBlock(channel));
                        self.close_client("reliable send would block".to_string(), false);
                        Err(TransportError::WouldBlock(channel))
                    }
                    WriteOutcome::Failed(e) => {
                        self.close_client(format!("reliable send failed: {}", e), false);
                        Err(TransportError::Io(e))
                    }
                }
            }
            Role::Idle => Err(TransportError::Inactive),
        }
    }

    fn send_unreliable(
        &mut self,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        match &mut self.role {
            Role::Host(host) => {
                host.send_unreliable(channel, payload, &mut self.events, &mut self.metrics)
            }
            Role::Client(outbound) => {
                if outbound.established() != Some(channel) {
                    return Err(TransportError::NotConnected(channel));
                }
                if payload.len() > MAX_DATAGRAM_PAYLOAD {
                    return Err(TransportError::DatagramTooLarge(payload.len()));
                }
                match outbound.socket.send(payload) {
                    Ok(sent) => {
                        outbound.metrics.record_sent(Delivery::Unreliable, sent);
                        self.metrics.record_sent(Delivery::Unreliable, sent);
                        Ok(())
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                    Err(e) => {
                        self.close_client(format!("datagram send failed: {}", e), false);
                        Err(TransportError::Io(e))
                    }
                }
            }
            Role::Idle => Err(TransportError::Inactive),
        }
    }

    fn disconnect(&mut self, channel: ChannelId) {
        match &mut self.role {
            Role::Host(host) => host.drop_peer(channel, &mut self.events),
            Role::Client(outbound) if outbound.channel().is_none_or(|own| own == channel) => {
                self.close_client("closed locally".to_string(), false);
            }
            _ => {}
        }
    }

    fn dispose(&mut self) {
        match std::mem::replace(&mut self.role, Role::Idle) {
            Role::Host(mut host) => {
                host.close_all(&mut self.events);
                log::info!("stopped listening on {}", host.local_addr);
            }
            client @ Role::Client(_) => {
                self.role = client;
                self.close_client("driver disposed".to_string(), false);
            }
            Role::Idle => {}
        }
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.events.pop()
    }

    fn connection_info(&self, channel: ChannelId) -> Option<ConnectionInfo> {
        match &self.role {
            Role::Host(host) => host.peers.get(&channel).map(Peer::info),
            Role::Client(outbound) => outbound.info().filter(|info| info.channel == channel),
            Role::Idle => None,
        }
    }

    fn connections(&self) -> Vec<ChannelId> {
        match &self.role {
            Role::Host(host) => host
                .peers
                .values()
                .filter(|peer| peer.handshake_done)
                .map(|peer| peer.channel)
                .collect(),
            Role::Client(outbound) => outbound.established().into_iter().collect(),
            Role::Idle => Vec::new(),
        }
    }

    fn metrics(&self) -> IoMetrics {
        self.metrics
    }

    fn take_metrics(&mut self) -> IoMetrics {
        self.metrics.take()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Host(host) => Some(host.local_addr),
            Role::Client(outbound) => outbound.stream.local_addr().ok(),
            Role::Idle => None,
        }
    }
}
