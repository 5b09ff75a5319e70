//! Driver over a platform-provided connection layer.
//!
//! The platform already knows who is on the other end of every connection,
//! so there is no channel-id handshake. Native ids are mapped onto
//! [`ChannelId`]s when the platform reports a connection.

use std::collections::{BTreeMap, HashMap};

use super::driver::{
    ChannelId, ConnectionInfo, Delivery, Driver, DriverEvent, DriverKind, EventQueue,
    TransportError,
};
use super::framing::{FrameTooLarge, MAX_RELIABLE_PAYLOAD};
use super::hybrid::MAX_DATAGRAM_PAYLOAD;
use super::metrics::IoMetrics;
use super::platform::{NativeId, NetworkPlatform, PlatformChannel, PlatformError, PlatformEvent};

#[derive(Debug)]
struct Link {
    native: NativeId,
    metrics: IoMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Host { max_connections: usize },
    Client { native: NativeId },
}

pub struct BuiltinDriver<P: NetworkPlatform> {
    platform: P,
    mode: Mode,
    links: BTreeMap<ChannelId, Link>,
    by_native: HashMap<NativeId, ChannelId>,
    next_channel: u16,
    events: EventQueue,
    metrics: IoMetrics,
}

impl<P: NetworkPlatform> BuiltinDriver<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            mode: Mode::Idle,
            links: BTreeMap::new(),
            by_native: HashMap::new(),
            next_channel: 1,
            events: EventQueue::default(),
            metrics: IoMetrics::default(),
        }
    }

    fn allocate_channel(&mut self) -> Option<ChannelId> {
        for _ in 0..u16::MAX {
            let candidate = ChannelId(self.next_channel);
            self.next_channel = self.next_channel.wrapping_add(1).max(1);
            if !self.links.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn tick(&mut self) {
        while let Some(event) = self.platform.poll() {
            match event {
                PlatformEvent::Connected(native) => self.on_connected(native),
                PlatformEvent::Disconnected(native) => {
                    if let Some(channel) = self.by_native.remove(&native) {
                        self.links.remove(&channel);
                        if matches!(self.mode, Mode::Client { .. }) {
                            self.mode = Mode::Idle;
                        }
                        log::info!("platform closed channel {}", channel);
                        self.events.push(DriverEvent::Disconnected(channel));
                    }
                }
                PlatformEvent::Data {
                    id,
                    channel: kind,
                    payload,
                } => {
                    let Some(&channel) = self.by_native.get(&id) else {
                        log::trace!("dropping data for unknown platform connection {}", id);
                        continue;
                    };
                    let delivery = match kind {
                        PlatformChannel::Ordered => Delivery::Reliable,
                        PlatformChannel::Unreliable => Delivery::Unreliable,
                    };
                    if let Some(link) = self.links.get_mut(&channel) {
                        link.metrics.record_received(delivery, payload.len());
                    }
                    self.metrics.record_received(delivery, payload.len());
                    self.events.push(DriverEvent::Message {
                        channel,
                        delivery,
                        payload,
                    });
                }
            }
        }
    }

    fn on_connected(&mut self, native: NativeId) {
        let accepted = match self.mode {
            Mode::Host { max_connections } => self.links.len() < max_connections,
            Mode::Client { native: own } => own == native,
            Mode::Idle => false,
        };
        if !accepted {
            log::warn!("refusing platform connection {}", native);
            self.platform.close(native);
            return;
        }
        let Some(channel) = self.allocate_channel() else {
            self.platform.close(native);
            return;
        };
        self.links.insert(
            channel,
            Link {
                native,
                metrics: IoMetrics::default(),
            },
        );
        self.by_native.insert(native, channel);
        log::info!("platform connection {} is channel {}", native, channel);
        self.events.push(DriverEvent::Connected(channel));
    }

    fn drop_link(&mut self, channel: ChannelId) {
        let Some(link) = self.links.remove(&channel) else {
            return;
        };
        self.by_native.remove(&link.native);
        self.platform.close(link.native);
        if matches!(self.mode, Mode::Client { .. }) {
            self.mode = Mode::Idle;
        }
        self.events.push(DriverEvent::Disconnected(channel));
    }

    fn send(
        &mut self,
        channel: ChannelId,
        delivery: Delivery,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let native = self
            .links
            .get(&channel)
            .map(|link| link.native)
            .ok_or(TransportError::NotConnected(channel))?;
        let kind = match delivery {
            Delivery::Reliable => PlatformChannel::Ordered,
            Delivery::Unreliable => PlatformChannel::Unreliable,
        };

        match self.platform.send(native, kind, payload) {
            Ok(()) => {
                if let Some(link) = self.links.get_mut(&channel) {
                    link.metrics.record_sent(delivery, payload.len());
                }
                self.metrics.record_sent(delivery, payload.len());
                Ok(())
            }
            Err(PlatformError::WouldBlock) => {
                log::warn!("ordered queue for {} is full, dropping it", channel);
                self.events.push(DriverEvent::ReliableSendWouldBlock(channel));
                self.drop_link(channel);
                Err(TransportError::WouldBlock(channel))
            }
            Err(e) => {
                log::warn!("platform send to {} failed: {}", channel, e);
                self.drop_link(channel);
                Err(e.into())
            }
        }
    }
}

impl<P: NetworkPlatform> Driver for BuiltinDriver<P> {
    fn kind(&self) -> DriverKind {
        DriverKind::Builtin
    }

    fn listen(&mut self, port: u16, max_connections: usize) -> Result<(), TransportError> {
        if self.mode != Mode::Idle {
            return Err(TransportError::AlreadyActive);
        }
        self.platform.listen(port)?;
        log::info!("listening on platform port {} (max {} connections)", port, max_connections);
        self.mode = Mode::Host { max_connections };
        Ok(())
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        if self.mode != Mode::Idle {
            return Err(TransportError::AlreadyActive);
        }
        let native = self.platform.connect(host, port)?;
        log::info!("connecting to {}:{} over the platform", host, port);
        self.mode = Mode::Client { native };
        Ok(())
    }

    fn tick_server(&mut self) {
        if matches!(self.mode, Mode::Host { .. }) {
            self.tick();
        }
    }

    fn tick_client(&mut self) {
        if matches!(self.mode, Mode::Client { .. }) {
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
        self.drop_link(channel);
    }

    fn dispose(&mut self) {
        let channels: Vec<ChannelId> = self.links.keys().copied().collect();
        for channel in channels {
            self.drop_link(channel);
        }
        self.platform.shutdown();
        self.mode = Mode::Idle;
    }

    fn poll_event(&mut self) -> Option<DriverEvent> {
        self.events.pop()
    }

    fn connection_info(&self, channel: ChannelId) -> Option<ConnectionInfo> {
        self.links.get(&channel).map(|link| ConnectionInfo {
            channel,
            address: format!("platform:{}", link.native),
            datagram_address: None,
            valid: true,
            metrics: link.metrics,
        })
    }

    fn connections(&self) -> Vec<ChannelId> {
        self.links.keys().copied().collect()
    }

    fn metrics(&self) -> IoMetrics {
        self.metrics
    }

    fn take_metrics(&mut self) -> IoMetrics {
        self.metrics.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::platform::{PacketLossSimulation, SimEndpoint, SimPlatform};

    fn pair(capacity: usize) -> (BuiltinDriver<SimEndpoint>, BuiltinDriver<SimEndpoint>) {
        let platform = SimPlatform::new(capacity, PacketLossSimulation::default());
        (
            BuiltinDriver::new(platform.endpoint()),
            BuiltinDriver::new(platform.endpoint()),
        )
    }

    fn drain(driver: &mut dyn Driver) -> Vec<DriverEvent> {
        std::iter::from_fn(|| driver.poll_event()).collect()
    }

    #[test]
    fn test_connect_without_handshake() {
        let (mut host, mut client) = pair(16);
        host.listen(7777, 4).unwrap();
        client.connect("sim", 7777).unwrap();

        host.tick_server();
        client.tick_client();

        assert_eq!(drain(&mut host), vec![DriverEvent::Connected(ChannelId(1))]);
        assert_eq!(drain(&mut client), vec![DriverEvent::Connected(ChannelId(1))]);

        client.send_reliable(ChannelId(1), b"hello").unwrap();
        client.send_unreliable(ChannelId(1), b"tick").unwrap();
        host.tick_server();

        assert_eq!(
            drain(&mut host),
            vec![
                DriverEvent::Message {
                    channel: ChannelId(1),
                    delivery: Delivery::Reliable,
                    payload: b"hello".to_vec(),
                },
                DriverEvent::Message {
                    channel: ChannelId(1),
                    delivery: Delivery::Unreliable,
                    payload: b"tick".to_vec(),
                },
            ]
        );
        assert_eq!(host.metrics().reliable.packets_received, 1);
    }

    #[test]
    fn test_host_refuses_over_capacity() {
        let platform = SimPlatform::new(16, PacketLossSimulation::default());
        let mut host = BuiltinDriver::new(platform.endpoint());
        let mut first = BuiltinDriver::new(platform.endpoint());
        let mut second = BuiltinDriver::new(platform.endpoint());
        host.listen(1, 1).unwrap();

        first.connect("sim", 1).unwrap();
        second.connect("sim", 1).unwrap();
        host.tick_server();
        first.tick_client();
        second.tick_client();

        assert_eq!(host.connections(), vec![ChannelId(1)]);
        assert_eq!(drain(&mut first), vec![DriverEvent::Connected(ChannelId(1))]);
        // The refused client saw its connection open and close again.
        assert_eq!(
            drain(&mut second),
            vec![
                DriverEvent::Connected(ChannelId(1)),
                DriverEvent::Disconnected(ChannelId(1)),
            ]
        );
    }

    #[test]
    fn test_full_queue_disconnects_once() {
        let (mut host, mut client) = pair(2);
        host.listen(2, 4).unwrap();
        client.connect("sim", 2).unwrap();
        host.tick_server();
        client.tick_client();
        drain(&mut host);
        drain(&mut client);

        host.send_reliable(ChannelId(1), b"a").unwrap();
        host.send_reliable(ChannelId(1), b"b").unwrap();
        assert!(matches!(
            host.send_reliable(ChannelId(1), b"c"),
            Err(TransportError::WouldBlock(ChannelId(1)))
        ));
        assert!(matches!(
            host.send_reliable(ChannelId(1), b"d"),
            Err(TransportError::NotConnected(ChannelId(1)))
        ));

        assert_eq!(
            drain(&mut host),
            vec![
                DriverEvent::ReliableSendWouldBlock(ChannelId(1)),
                DriverEvent::Disconnected(ChannelId(1)),
            ]
        );

        client.tick_client();
        let events = drain(&mut client);
        assert_eq!(events.last(), Some(&DriverEvent::Disconnected(ChannelId(1))));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, DriverEvent::Disconnected(_)))
                .count(),
            1
        );
    }
}
