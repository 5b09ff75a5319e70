//! In-process driver pair sharing two fixed-capacity byte buffers.
//!
//! Every record is a 4-byte little-endian header followed by the payload.
//! The low 31 bits of the header hold the payload length and the high bit
//! marks an unreliable record. Both directions are lossless and ordered.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use super::driver::{
    ChannelId, ConnectionInfo, Delivery, Driver, DriverEvent, DriverKind, EventQueue,
    TransportError,
};
use super::framing::{FrameTooLarge, MAX_RELIABLE_PAYLOAD};
use super::hybrid::MAX_DATAGRAM_PAYLOAD;
use super::metrics::IoMetrics;

pub const RECORD_HEADER_SIZE: usize = 4;
pub const UNRELIABLE_FLAG: u32 = 1 << 31;

/// The only channel a loopback pair ever carries.
pub const LOOPBACK_CHANNEL: ChannelId = ChannelId(1);

#[derive(Debug)]
struct RecordBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl RecordBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, delivery: Delivery, payload: &[u8]) -> bool {
        if self.bytes.len() + RECORD_HEADER_SIZE + payload.len() > self.capacity {
            return false;
        }
        let mut header = payload.len() as u32;
        if delivery == Delivery::Unreliable {
            header |= UNRELIABLE_FLAG;
        }
        self.bytes.extend_from_slice(&header.to_le_bytes());
        self.bytes.extend_from_slice(payload);
        true
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Host,
    Client,
}

impl End {
    fn other(self) -> Self {
        match self {
            End::Host => End::Client,
            End::Client => End::Host,
        }
    }
}

#[derive(Debug)]
struct Shared {
    to_host: RecordBuffer,
    to_client: RecordBuffer,
    host_listening: bool,
    connect_requested: bool,
    connect_accepted: bool,
    host_closed_by_peer: bool,
    client_closed_by_peer: bool,
}

impl Shared {
    fn inbound(&mut self, end: End) -> &mut RecordBuffer {
        match end {
            End::Host => &mut self.to_host,
            End::Client => &mut self.to_client,
        }
    }

    fn closed_by_peer(&mut self, end: End) -> &mut bool {
        match end {
            End::Host => &mut self.host_closed_by_peer,
            End::Client => &mut self.client_closed_by_peer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Listening,
    Connecting,
    Connected,
}

/// One end of a loopback pair created by [`LoopbackDriver::pair`].
pub struct LoopbackDriver {
    shared: Rc<RefCell<Shared>>,
    end: End,
    state: State,
    events: EventQueue,
    metrics: IoMetrics,
    connection_metrics: IoMetrics,
}

impl LoopbackDriver {
    /// Returns `(host, client)`, each direction buffered up to `capacity` bytes.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let shared = Rc::new(RefCell::new(Shared {
            to_host: RecordBuffer::new(capacity),
            to_client: RecordBuffer::new(capacity),
            host_listening: false,
            connect_requested: false,
            connect_accepted: false,
            host_closed_by_peer: false,
            client_closed_by_peer: false,
        }));
        (
            Self::new(Rc::clone(&shared), End::Host),
            Self::new(shared, End::Client),
        )
    }

    fn new(shared: Rc<RefCell<Shared>>, end: End) -> Self {
        Self {
            shared,
            end,
            state: State::Idle,
            events: EventQueue::default(),
            metrics: IoMetrics::default(),
            connection_metrics: IoMetrics::default(),
        }
    }

    fn resting_state(&self) -> State {
        match self.end {
            End::Host if self.shared.borrow().host_listening => State::Listening,
            _ => State::Idle,
        }
    }

    /// Tears the connection down locally and flags the other end.
    fn close(&mut self, notify_peer: bool) {
        if self.state != State::Connected && self.state != State::Connecting {
            return;
        }
        let was_connected = self.state == State::Connected;
        {
            let mut shared = self.shared.borrow_mut();
            // A pending accept means the host already counts us as connected.
            let peer_connected = was_connected || shared.connect_accepted;
            shared.inbound(self.end).clear();
            shared.connect_requested = false;
            shared.connect_accepted = false;
            if notify_peer && peer_connected {
                // The peer drains what we already sent before it closes.
                *shared.closed_by_peer(self.end.other()) = true;
            } else {
                shared.inbound(self.end.other()).clear();
            }
        }
        self.state = self.resting_state();
        self.connection_metrics = IoMetrics::default();
        if was_connected {
            self.events.push(DriverEvent::Disconnected(LOOPBACK_CHANNEL));
        }
    }

    fn tick(&mut self) {
        let closed = std::mem::take(self.shared.borrow_mut().closed_by_peer(self.end));
        if closed {
            log::info!("loopback peer closed the connection");
            if self.state == State::Connected {
                self.drain();
            }
            self.close(false);
        }

        match (self.end, self.state) {
            (End::Host, State::Listening) => {
                let requested = std::mem::take(&mut self.shared.borrow_mut().connect_requested);
                if requested {
                    self.shared.borrow_mut().connect_accepted = true;
                    self.state = State::Connected;
                    self.events.push(DriverEvent::Connected(LOOPBACK_CHANNEL));
                }
            }
            (End::Client, State::Connecting) => {
                let accepted = std::mem::take(&mut self.shared.borrow_mut().connect_accepted);
                if accepted {
                    self.state = State::Connected;
                    self.events.push(DriverEvent::Connected(LOOPBACK_CHANNEL));
                }
            }
            _ => {}
        }

        if self.state == State::Connected {
            self.drain();
        }
    }

    fn drain(&mut self) {
        let bytes = std::mem::take(&mut self.shared.borrow_mut().inbound(self.end).bytes);
        let mut rest = bytes.as_slice();

        while !rest.is_empty() {
            let Some((header, tail)) = rest.split_first_chunk::<RECORD_HEADER_SIZE>() else {
                self.invalid();
                return;
            };
            let header = u32::from_le_bytes(*header);
            let len = (header & !UNRELIABLE_FLAG) as usize;
            if tail.len() < len {
                self.invalid();
                return;
            }
            let delivery = if header & UNRELIABLE_FLAG != 0 {
                Delivery::Unreliable
            } else {
                Delivery::Reliable
            };
            let (payload, tail) = tail.split_at(len);
            self.connection_metrics.record_received(delivery, len);
            self.metrics.record_received(delivery, len);
            self.events.push(DriverEvent::Message {
                channel: LOOPBACK_CHANNEL,
                delivery,
                payload: payload.to_vec(),
            });
            rest = tail;
        }

        // Hand the allocation back for reuse.
        let mut bytes = bytes;
        bytes.clear();
        let mut shared = self.shared.borrow_mut();
        let inbound = shared.inbound(self.end);
        if inbound.bytes.is_empty() {
            inbound.bytes = bytes;
        }
    }

    fn invalid(&mut self) {
        log::warn!("malformed loopback record, closing");
        self.events.push(DriverEvent::InvalidMessage(LOOPBACK_CHANNEL));
        self.close(true);
    }

    fn send(
        &mut self,
        channel: ChannelId,
        delivery: Delivery,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if channel != LOOPBACK_CHANNEL || self.state != State::Connected {
            return Err(TransportError::NotConnected(channel));
        }
        let written = {
            let mut shared = self.shared.borrow_mut();
            shared.inbound(self.end.other()).push(delivery, payload)
        };
        if !written {
            log::warn!("loopback buffer is full, closing");
            self.events.push(DriverEvent::ReliableSendWouldBlock(channel));
            self.close(true);
            return Err(TransportError::WouldBlock(channel));
        }
        self.connection_metrics.record_sent(delivery, payload.len());
        self.metrics.record_sent(delivery, payload.len());
        Ok(())
    }
}

impl Driver for LoopbackDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Loopback
    }

    fn listen(&mut self, _port: u16, max_connections: usize) -> Result<(), TransportError> {
        if self.end != End::Host || self.state != State::Idle {
            return Err(TransportError::AlreadyActive);
        }
        if max_connections == 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "loopback host needs room for one connection",
            )));
        }
        self.shared.borrow_mut().host_listening = true;
        self.state = State::Listening;
        log::info!("loopback host listening");
        Ok(())
    }

    fn connect(&mut self, _host: &str, _port: u16) -> Result<(), TransportError> {
        if self.end != End::Client || self.state != State::Idle {
            return Err(TransportError::AlreadyActive);
        }
        let mut shared = self.shared.borrow_mut();
        if !shared.host_listening {
            return Err(TransportError::Io(io::ErrorKind::ConnectionRefused.into()));
        }
        shared.connect_requested = true;
        shared.connect_accepted = false;
        drop(shared);
        self.state = State::Connecting;
        Ok(())
    }

    fn tick_server(&mut self) {
        if self.end == End::Host {
            self.tick();
        }
    }

    fn tick_client(&mut self) {
        if self.end == End::Client {
            self.tick();
        }
    }

    fn send_reliable(&mut self, channel: ChannelId, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_RELIABLE_PAYLOAD {
            return Err(FrameTooLarge { len: payload.len() }.into());
        }
        self.send(channel, Delivery::Reliable, payload)
    }

    fn send_unreliable(
        &mut self,
        channel: ChannelId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if payload.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(TransportError::DatagramTooLarge(payload.len()));
        }
        self.send(channel, Delivery::Unreliable, payload)
    }

    fn disconnect(&mut self, channel: ChannelId) {
        if channel == LOOPBACK_CHANNEL {
            self.close(true);
        }
    }

    fn dispose(&mut self) {
        self.close(true);
        if self.end == End::Host {
            self.shared.borrow_mut().host_listening = false;
        }
        self.state = State::Idle;
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.events.pop()
    }

    fn connection_info(&self, channel: ChannelId) -> Option<ConnectionInfo> {
        (channel == LOOPBACK_CHANNEL && self.state == State::Connected).then(|| ConnectionInfo {
            channel,
            address: "loopback".to_string(),
            datagram_address: None,
            valid: true,
            metrics: self.connection_metrics,
        })
    }

    fn connections(&self) -> Vec<ChannelId> {
        if self.state == State::Connected {
            vec![LOOPBACK_CHANNEL]
        } else {
            Vec::new()
        }
    }

    fn metrics(&self) -> IoMetrics {
        self.metrics
    }

    fn take_metrics(&mut self) -> IoMetrics {
        self.metrics.take()
    }
}
