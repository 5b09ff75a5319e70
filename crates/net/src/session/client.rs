use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use uuid::Uuid;

use super::SessionError;
use super::messages::{
    ClientConnect, ClientFinishedTravel, ClientInbound, ClientLevelStarted, ClientTravel,
    Disconnect, DisconnectReason, Heartbeat, Welcome, client_registry,
};
use crate::config::ClientConfig;
use crate::message::{Message, MessageError, MessageRegistry, MessageWriter};
use crate::net::{ChannelId, Connection, Delivery, Driver, DriverEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Joining,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    TransportConnected {
        channel: ChannelId,
    },
    Welcomed {
        server_name: String,
        message: String,
        connection_id: u32,
    },
    /// The game should load `level`, then call [`ClientSession::finish_travel`].
    TravelRequested {
        level: String,
        keep_alive_ids: Vec<u32>,
    },
    Disconnected {
        reason: DisconnectReason,
        detail: String,
    },
    Message {
        delivery: Delivery,
        payload: Vec<u8>,
    },
    InvalidMessage,
}

/// Participant side of the session protocol.
pub struct ClientSession {
    config: ClientConfig,
    driver: Box<dyn Driver>,
    registry: MessageRegistry<ClientInbound>,
    writer: MessageWriter,
    state: ClientState,
    server: Option<Connection>,
    server_name: Option<String>,
    level: Option<String>,
    travel_target: Option<String>,
    level_started: bool,
    known_actors: HashSet<u32>,
    connect_started: Instant,
    last_heartbeat: Instant,
    closing: Option<(DisconnectReason, String)>,
    pending_events: VecDeque<ClientEvent>,
}

impl ClientSession {
    pub fn new(config: ClientConfig, driver: Box<dyn Driver>) -> Result<Self, SessionError> {
        let now = Instant::now();
        Ok(Self {
            registry: client_registry()?,
            writer: MessageWriter::with_capacity(1024),
            state: ClientState::Disconnected,
            server: None,
            server_name: None,
            level: None,
            travel_target: None,
            level_started: false,
            known_actors: HashSet::new(),
            connect_started: now,
            last_heartbeat: now,
            closing: None,
            pending_events: VecDeque::new(),
            config,
            driver,
        })
    }

    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), SessionError> {
        if self.state != ClientState::Disconnected {
            return Err(SessionError::InvalidState("already connected"));
        }
        self.driver.connect(host, port)?;
        log::info!("connecting to {}:{}", host, port);
        self.state = ClientState::Connecting;
        self.connect_started = Instant::now();
        self.closing = None;
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn identity(&self) -> Uuid {
        self.config.identity
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Id assigned by the server's `Welcome`.
    pub fn connection_id(&self) -> Option<u32> {
        match self.state {
            ClientState::Joining | ClientState::Connected => {
                self.server.as_ref().map(Connection::id)
            }
            _ => None,
        }
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// The last level this client finished traveling to.
    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    pub fn travel_target(&self) -> Option<&str> {
        self.travel_target.as_deref()
    }

    pub fn is_level_started(&self) -> bool {
        self.level_started
    }

    pub fn mark_known(&mut self, actor_id: u32) -> bool {
        self.known_actors.insert(actor_id)
    }

    pub fn knows_actor(&self, actor_id: u32) -> bool {
        self.known_actors.contains(&actor_id)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn tick(&mut self) {
        self.driver.tick_client();
        self.pump();

        let now = Instant::now();
        match self.state {
            ClientState::Connecting => {
                let waited = now.saturating_duration_since(self.connect_started);
                if waited > self.config.connect_timeout() {
                    log::warn!("no welcome from the server after {:?}", waited);
                    self.close(
                        DisconnectReason::TimedOut,
                        format!("no welcome after {:.1}s", waited.as_secs_f32()),
                    );
                }
            }
            ClientState::Joining | ClientState::Connected => {
                if now.saturating_duration_since(self.last_heartbeat)
                    >= self.config.heartbeat_interval()
                {
                    self.last_heartbeat = now;
                    if let Err(e) = self.send(Delivery::Unreliable, &Heartbeat) {
                        log::debug!("heartbeat failed: {}", e);
                    }
                    self.pump();
                }
            }
            ClientState::Disconnected => {}
        }
    }

    pub fn send<M: Message>(&mut self, delivery: Delivery, message: &M) -> Result<(), SessionError> {
        let server = self
            .server
            .as_ref()
            .ok_or(SessionError::InvalidState("not connected"))?;
        match delivery {
            Delivery::Reliable => {
                server.send_reliable(self.driver.as_mut(), &mut self.writer, message)?
            }
            Delivery::Unreliable => {
                server.send_unreliable(self.driver.as_mut(), &mut self.writer, message)?
            }
        }
        Ok(())
    }

    /// Reports that the level named by the last `ClientTravel` is loaded.
    pub fn finish_travel(&mut self) -> Result<(), SessionError> {
        let Some(level) = self.travel_target.clone() else {
            return Err(SessionError::InvalidState("not traveling"));
        };
        self.send(
            Delivery::Reliable,
            &ClientFinishedTravel {
                level: level.clone(),
            },
        )?;
        log::info!("finished travel to {}", level);
        self.travel_target = None;
        self.level = Some(level);
        Ok(())
    }

    /// Reports that the loaded level is running and ready for replication.
    pub fn notify_level_started(&mut self) -> Result<(), SessionError> {
        if self.level.is_none() || self.travel_target.is_some() {
            return Err(SessionError::InvalidState("no level loaded"));
        }
        if self.level_started {
            return Ok(());
        }
        self.send(Delivery::Reliable, &ClientLevelStarted)?;
        self.level_started = true;
        self.state = ClientState::Connected;
        Ok(())
    }

    /// Leaves the session, telling the server when a connection exists.
    pub fn disconnect(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        let goodbye = Disconnect {
            reason: DisconnectReason::User,
            detail: String::new(),
        };
        if self.server.is_some() {
            if let Err(e) = self.send(Delivery::Reliable, &goodbye) {
                log::debug!("could not deliver disconnect: {}", e);
            }
        }
        self.close(DisconnectReason::User, String::new());
    }

    fn pump(&mut self) {
        while let Some(event) = self.driver.poll_event() {
            match event {
                DriverEvent::Connected(channel) => self.on_transport_connected(channel),
                DriverEvent::Disconnected(channel) => {
                    log::info!("transport channel {} closed", channel);
                    let (reason, detail) = self
                        .closing
                        .take()
                        .unwrap_or((DisconnectReason::Error, "connection lost".to_string()));
                    self.teardown(reason, detail);
                }
                DriverEvent::ConnectFailed(reason) => {
                    self.teardown(DisconnectReason::Error, reason);
                }
                DriverEvent::Message {
                    delivery, payload, ..
                } => self.on_message(delivery, payload),
                DriverEvent::InvalidMessage(channel) => {
                    log::warn!("invalid message on {}", channel);
                    self.pending_events.push_back(ClientEvent::InvalidMessage);
                }
                DriverEvent::ReliableSendWouldBlock(_) => {
                    self.closing = Some((
                        DisconnectReason::Error,
                        "reliable channel is not draining".to_string(),
                    ));
                }
            }
        }
    }

    fn on_transport_connected(&mut self, channel: ChannelId) {
        if self.state != ClientState::Connecting || self.server.is_some() {
            return;
        }
        let address = self
            .driver
            .connection_info(channel)
            .map(|info| info.address)
            .unwrap_or_default();
        log::debug!("transport connected on {}, waiting for welcome", channel);
        self.server = Some(Connection::new(0, channel, address));
        self.pending_events
            .push_back(ClientEvent::TransportConnected { channel });
    }

    fn on_message(&mut self, delivery: Delivery, payload: Vec<u8>) {
        match self.registry.decode(&payload) {
            Ok(ClientInbound::Welcome(welcome)) => self.on_welcome(welcome),
            Ok(ClientInbound::Disconnect(disconnect)) => {
                log::info!(
                    "server closed the session: {} {}",
                    disconnect.reason,
                    disconnect.detail
                );
                self.close(disconnect.reason, disconnect.detail);
            }
            Ok(ClientInbound::ClientTravel(travel)) => self.on_travel(travel),
            Err(MessageError::UnknownType(_)) => {
                self.pending_events
                    .push_back(ClientEvent::Message { delivery, payload });
            }
            Err(e) => {
                log::warn!("malformed message from the server: {}", e);
                self.pending_events.push_back(ClientEvent::InvalidMessage);
            }
        }
    }

    fn on_welcome(&mut self, welcome: Welcome) {
        let Some(server) = self.server.as_ref().filter(|_| self.state == ClientState::Connecting)
        else {
            log::debug!("ignoring unexpected welcome");
            return;
        };
        log::info!(
            "welcomed by {} as connection {}: {}",
            welcome.server_name,
            welcome.connection_id,
            welcome.message
        );
        self.server = Some(Connection::new(
            welcome.connection_id,
            server.channel(),
            server.address(),
        ));
        self.server_name = Some(welcome.server_name.clone());
        self.state = ClientState::Joining;
        self.last_heartbeat = Instant::now();
        self.pending_events.push_back(ClientEvent::Welcomed {
            server_name: welcome.server_name,
            message: welcome.message,
            connection_id: welcome.connection_id,
        });

        let connect = ClientConnect::new(self.config.version.clone(), self.config.identity);
        if let Err(e) = self.send(Delivery::Reliable, &connect) {
            log::warn!("failed to send ClientConnect: {}", e);
        }
    }

    fn on_travel(&mut self, travel: ClientTravel) {
        if !matches!(self.state, ClientState::Joining | ClientState::Connected) {
            log::debug!("ignoring travel to {} before joining", travel.level);
            return;
        }
        log::info!("server requested travel to {}", travel.level);
        self.travel_target = Some(travel.level.clone());
        self.level_started = false;
        self.known_actors
            .retain(|id| travel.keep_alive_ids.contains(id));
        self.pending_events.push_back(ClientEvent::TravelRequested {
            level: travel.level,
            keep_alive_ids: travel.keep_alive_ids,
        });
    }

    /// Drops the transport at once and reports `reason`.
    fn close(&mut self, reason: DisconnectReason, detail: String) {
        self.driver.dispose();
        while self.driver.poll_event().is_some() {}
        self.teardown(reason, detail);
    }

    fn teardown(&mut self, reason: DisconnectReason, detail: String) {
        if self.state == ClientState::Disconnected {
            return;
        }
        log::info!("disconnected: {} {}", reason, detail);
        self.state = ClientState::Disconnected;
        self.server = None;
        self.server_name = None;
        self.level = None;
        self.travel_target = None;
        self.level_started = false;
        self.known_actors.clear();
        self.closing = None;
        self.pending_events
            .push_back(ClientEvent::Disconnected { reason, detail });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{LoopbackDriver, loopback::LOOPBACK_CHANNEL};
    use crate::session::{ServerInbound, server_registry};

    struct Harness {
        session: ClientSession,
        host: LoopbackDriver,
        writer: MessageWriter,
    }

    impl Harness {
        fn new(config: ClientConfig) -> Self {
            let (mut host, client) = LoopbackDriver::pair(64 * 1024);
            host.listen(0, 1).unwrap();
            let mut session = ClientSession::new(config, Box::new(client)).unwrap();
            session.connect("localhost", 0).unwrap();
            host.tick_server();
            session.tick();
            Self {
                session,
                host,
                writer: MessageWriter::new(),
            }
        }

        fn send<M: Message>(&mut self, message: &M) {
            let frame = self.writer.write(message).unwrap().to_vec();
            self.host.send_reliable(LOOPBACK_CHANNEL, &frame).unwrap();
            self.session.tick();
        }

        fn received(&mut self) -> Vec<ServerInbound> {
            let registry = server_registry().unwrap();
            self.host.tick_server();
            std::iter::from_fn(|| self.host.poll_event())
                .filter_map(|event| match event {
                    DriverEvent::Message { payload, .. } => registry.decode(&payload).ok(),
                    _ => None,
                })
                .collect()
        }

        fn welcome(&mut self) {
            self.send(&Welcome {
                server_name: "Host".to_string(),
                message: "hi".to_string(),
                connection_id: 1,
            });
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            version: "v1.0".to_string(),
            heartbeat_interval_ms: 60_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_stays_connecting_until_welcome() {
        let mut harness = Harness::new(config());
        assert_eq!(harness.session.state(), ClientState::Connecting);
        assert_eq!(harness.session.connection_id(), None);

        harness.welcome();
        assert_eq!(harness.session.state(), ClientState::Joining);
        assert_eq!(harness.session.connection_id(), Some(1));

        let identity = harness.session.identity();
        assert_eq!(
            harness.received(),
            vec![ServerInbound::ClientConnect(ClientConnect::new("v1.0", identity))]
        );
    }

    #[test]
    fn test_travel_then_level_start() {
        let mut harness = Harness::new(config());
        harness.welcome();
        harness.received();
        harness.session.mark_known(5);
        harness.session.mark_known(6);

        harness.send(&ClientTravel {
            level: "Level_Foo".to_string(),
            keep_alive_ids: vec![6],
        });
        assert_eq!(harness.session.travel_target(), Some("Level_Foo"));
        assert!(harness.session.knows_actor(6));
        assert!(!harness.session.knows_actor(5));
        assert!(harness.session.notify_level_started().is_err());

        harness.session.finish_travel().unwrap();
        harness.session.notify_level_started().unwrap();
        assert_eq!(harness.session.state(), ClientState::Connected);
        assert_eq!(
            harness.received(),
            vec![
                ServerInbound::ClientFinishedTravel(ClientFinishedTravel {
                    level: "Level_Foo".to_string(),
                }),
                ServerInbound::ClientLevelStarted(ClientLevelStarted),
            ]
        );
    }

    #[test]
    fn test_server_disconnect_carries_reason() {
        let mut harness = Harness::new(config());
        harness.welcome();
        harness.send(&Disconnect {
            reason: DisconnectReason::WrongVersion,
            detail: "v2.0".to_string(),
        });

        assert_eq!(harness.session.state(), ClientState::Disconnected);
        let events: Vec<_> = harness.session.drain_events().collect();
        assert_eq!(
            events.last(),
            Some(&ClientEvent::Disconnected {
                reason: DisconnectReason::WrongVersion,
                detail: "v2.0".to_string(),
            })
        );
    }

    #[test]
    fn test_connect_timeout_without_welcome() {
        let mut harness = Harness::new(ClientConfig {
            connect_timeout_ms: 0,
            ..config()
        });
        std::thread::sleep(std::time::Duration::from_millis(2));
        harness.session.tick();

        assert_eq!(harness.session.state(), ClientState::Disconnected);
        assert!(harness.session.drain_events().any(|event| matches!(
            event,
            ClientEvent::Disconnected {
                reason: DisconnectReason::TimedOut,
                ..
            }
        )));
    }

    #[test]
    fn test_user_disconnect_is_idempotent() {
        let mut harness = Harness::new(config());
        harness.welcome();
        harness.received();

        harness.session.disconnect();
        harness.session.disconnect();

        let disconnects = harness
            .session
            .drain_events()
            .filter(|event| matches!(event, ClientEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(
            harness.received(),
            vec![ServerInbound::Disconnect(Disconnect {
                reason: DisconnectReason::User,
                detail: String::new(),
            })]
        );
    }
}
