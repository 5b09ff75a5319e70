use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Instant;

use uuid::Uuid;

use super::SessionError;
use super::messages::{
    ClientConnect, ClientFinishedTravel, ClientTravel, Disconnect, DisconnectReason,
    ServerInbound, Welcome, server_registry,
};
use crate::config::ServerConfig;
use crate::message::{Message, MessageError, MessageRegistry, MessageWriter};
use crate::net::{ChannelId, Connection, Delivery, Driver, DriverEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        channel: ChannelId,
        connection_id: u32,
        address: String,
    },
    ClientJoined {
        channel: ChannelId,
        identity: Uuid,
        version: String,
    },
    TravelIssued {
        channel: ChannelId,
        level: String,
    },
    ClientTraveled {
        channel: ChannelId,
        level: String,
    },
    LevelStarted {
        channel: ChannelId,
        level: String,
    },
    ClientDisconnected {
        channel: ChannelId,
        connection_id: u32,
        reason: DisconnectReason,
        detail: String,
    },
    /// A message outside the session protocol, left for the game to decode.
    Message {
        channel: ChannelId,
        delivery: Delivery,
        payload: Vec<u8>,
    },
    InvalidMessage {
        channel: ChannelId,
    },
}

/// Handshake and travel progress of one participant.
#[derive(Debug)]
pub struct PeerState {
    connection: Connection,
    pub did_handshake: bool,
    pub pending_connect: bool,
    pub is_traveling: bool,
    pub client_level: Option<String>,
    pub level_started: bool,
    identity: Option<Uuid>,
    version: Option<String>,
    connected_at: Instant,
    last_heard: Instant,
    known_actors: HashSet<u32>,
    closing: Option<(DisconnectReason, String)>,
}

impl PeerState {
    fn new(connection: Connection, now: Instant) -> Self {
        Self {
            connection,
            did_handshake: false,
            pending_connect: true,
            is_traveling: false,
            client_level: None,
            level_started: false,
            identity: None,
            version: None,
            connected_at: now,
            last_heard: now,
            known_actors: HashSet::new(),
            closing: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channel(&self) -> ChannelId {
        self.connection.channel()
    }

    pub fn connection_id(&self) -> u32 {
        self.connection.id()
    }

    pub fn address(&self) -> &str {
        self.connection.address()
    }

    pub fn identity(&self) -> Option<Uuid> {
        self.identity
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_heard(&self) -> Instant {
        self.last_heard
    }

    pub fn knows_actor(&self, actor_id: u32) -> bool {
        self.known_actors.contains(&actor_id)
    }

    pub fn known_actors(&self) -> impl Iterator<Item = u32> + '_ {
        self.known_actors.iter().copied()
    }
}

/// Authoritative side of the session protocol.
///
/// Owns the driver. Call [`ServerSession::tick`] once per frame, then drain
/// [`ServerEvent`]s.
pub struct ServerSession {
    config: ServerConfig,
    driver: Box<dyn Driver>,
    registry: MessageRegistry<ServerInbound>,
    writer: MessageWriter,
    peers: BTreeMap<ChannelId, PeerState>,
    next_connection_id: u32,
    current_level: Option<String>,
    keep_alive_ids: Vec<u32>,
    pending_events: VecDeque<ServerEvent>,
}

impl ServerSession {
    pub fn new(config: ServerConfig, driver: Box<dyn Driver>) -> Result<Self, SessionError> {
        Ok(Self {
            registry: server_registry()?,
            writer: MessageWriter::with_capacity(1024),
            peers: BTreeMap::new(),
            next_connection_id: 0,
            current_level: None,
            keep_alive_ids: Vec::new(),
            pending_events: VecDeque::new(),
            config,
            driver,
        })
    }

    pub fn listen(&mut self, port: u16) -> Result<(), SessionError> {
        self.driver.listen(port, self.config.max_clients)?;
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> &mut dyn Driver {
        self.driver.as_mut()
    }

    pub fn current_level(&self) -> Option<&str> {
        self.current_level.as_deref()
    }

    pub fn peer(&self, channel: ChannelId) -> Option<&PeerState> {
        self.peers.get(&channel)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn tick(&mut self) {
        self.driver.tick_server();
        self.pump();
        self.expire_connections(Instant::now());
        self.pump();
    }

    /// Moves the server to `level`.
    ///
    /// Every joined connection still on the departing level is told to
    /// travel. Connections that are mid-travel catch up when they report
    /// their finished level.
    pub fn travel(&mut self, level: impl Into<String>, keep_alive_ids: Vec<u32>) {
        let level = level.into();
        let departing = self.current_level.replace(level.clone());
        self.keep_alive_ids = keep_alive_ids;
        log::info!(
            "traveling from {} to {}",
            departing.as_deref().unwrap_or("<none>"),
            level
        );

        let travelers: Vec<ChannelId> = self
            .peers
            .values()
            .filter(|peer| peer.did_handshake && peer.client_level == departing)
            .map(PeerState::channel)
            .collect();
        for channel in travelers {
            self.send_travel(channel, level.clone(), self.keep_alive_ids.clone());
        }
        self.pump();
    }

    /// Sends `message` to one connection regardless of its travel state.
    pub fn send<M: Message>(
        &mut self,
        channel: ChannelId,
        delivery: Delivery,
        message: &M,
    ) -> Result<(), SessionError> {
        let peer = self
            .peers
            .get(&channel)
            .ok_or(SessionError::UnknownConnection(channel))?;
        match delivery {
            Delivery::Reliable => {
                peer.connection
                    .send_reliable(self.driver.as_mut(), &mut self.writer, message)?
            }
            Delivery::Unreliable => {
                peer.connection
                    .send_unreliable(self.driver.as_mut(), &mut self.writer, message)?
            }
        }
        Ok(())
    }

    /// Sends replication traffic, skipping connections whose level has not started.
    ///
    /// Returns whether the message was sent.
    pub fn send_replicated<M: Message>(
        &mut self,
        channel: ChannelId,
        delivery: Delivery,
        message: &M,
    ) -> Result<bool, SessionError> {
        let started = self
            .peers
            .get(&channel)
            .map(|peer| peer.level_started)
            .ok_or(SessionError::UnknownConnection(channel))?;
        if !started {
            return Ok(false);
        }
        self.send(channel, delivery, message)?;
        Ok(true)
    }

    /// Returns the number of connections the message reached.
    pub fn broadcast_replicated<M: Message>(&mut self, delivery: Delivery, message: &M) -> usize {
        let targets: Vec<ChannelId> = self
            .peers
            .values()
            .filter(|peer| peer.level_started)
            .map(PeerState::channel)
            .collect();

        let mut reached = 0;
        for channel in targets {
            match self.send(channel, delivery, message) {
                Ok(()) => reached += 1,
                Err(e) => log::debug!("replication to {} failed: {}", channel, e),
            }
        }
        self.pump();
        reached
    }

    /// Records that `channel` knows about `actor_id`. Returns `false` if it already did.
    pub fn mark_replicated(&mut self, channel: ChannelId, actor_id: u32) -> bool {
        self.peers
            .get_mut(&channel)
            .is_some_and(|peer| peer.known_actors.insert(actor_id))
    }

    pub fn kick(&mut self, channel: ChannelId, reason: DisconnectReason, detail: impl Into<String>) {
        self.close_peer(channel, reason, detail.into());
        self.pump();
    }

    /// Kicks every connection and releases the driver.
    pub fn shutdown(&mut self) {
        let channels: Vec<ChannelId> = self.peers.keys().copied().collect();
        for channel in channels {
            self.close_peer(channel, DisconnectReason::User, "server shutting down".to_string());
        }
        self.pump();
        self.driver.dispose();
        self.pump();
    }

    fn pump(&mut self) {
        while let Some(event) = self.driver.poll_event() {
            match event {
                DriverEvent::Connected(channel) => self.on_connected(channel),
                DriverEvent::Disconnected(channel) => self.on_disconnected(channel),
                DriverEvent::Message {
                    channel,
                    delivery,
                    payload,
                } => self.on_message(channel, delivery, payload),
                DriverEvent::InvalidMessage(channel) => {
                    log::warn!("invalid message from {}", channel);
                    self.pending_events
                        .push_back(ServerEvent::InvalidMessage { channel });
                }
                DriverEvent::ReliableSendWouldBlock(channel) => {
                    if let Some(peer) = self.peers.get_mut(&channel) {
                        if peer.closing.is_none() {
                            peer.closing = Some((
                                DisconnectReason::Error,
                                "reliable channel is not draining".to_string(),
                            ));
                        }
                    }
                }
                DriverEvent::ConnectFailed(reason) => {
                    log::warn!("host driver reported a connect failure: {}", reason);
                }
            }
        }
    }

    fn allocate_connection_id(&mut self) -> u32 {
        self.next_connection_id = self.next_connection_id.wrapping_add(1).max(1);
        self.next_connection_id
    }

    fn on_connected(&mut self, channel: ChannelId) {
        let address = self
            .driver
            .connection_info(channel)
            .map(|info| info.address)
            .unwrap_or_default();
        let connection_id = self.allocate_connection_id();
        let connection = Connection::new(connection_id, channel, address.clone());
        self.peers
            .insert(channel, PeerState::new(connection, Instant::now()));

        log::info!(
            "{} connected from {} as connection {}",
            channel,
            address,
            connection_id
        );
        self.pending_events.push_back(ServerEvent::ClientConnected {
            channel,
            connection_id,
            address,
        });

        let welcome = Welcome {
            server_name: self.config.server_name.clone(),
            message: self.config.motd.clone(),
            connection_id,
        };
        if let Err(e) = self.send(channel, Delivery::Reliable, &welcome) {
            log::warn!("failed to welcome {}: {}", channel, e);
        }
    }

    fn on_disconnected(&mut self, channel: ChannelId) {
        let Some(peer) = self.peers.remove(&channel) else {
            return;
        };
        let (reason, detail) = peer
            .closing
            .unwrap_or((DisconnectReason::Error, "connection lost".to_string()));
        log::info!(
            "{} (connection {}) disconnected: {} {}",
            channel,
            peer.connection.id(),
            reason,
            detail
        );
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected {
                channel,
                connection_id: peer.connection.id(),
                reason,
                detail,
            });
    }

    fn on_message(&mut self, channel: ChannelId, delivery: Delivery, payload: Vec<u8>) {
        let Some(peer) = self.peers.get_mut(&channel) else {
            return;
        };
        peer.last_heard = Instant::now();
        let joined = peer.did_handshake;

        match self.registry.decode(&payload) {
            Ok(ServerInbound::ClientConnect(connect)) => self.on_client_connect(channel, connect),
            Ok(ServerInbound::Disconnect(disconnect)) => {
                self.close_peer(channel, disconnect.reason, disconnect.detail);
            }
            Ok(_) if !joined => {
                log::warn!("{} sent a session message before its handshake", channel);
            }
            Ok(ServerInbound::ClientFinishedTravel(finished)) => {
                self.on_finished_travel(channel, finished);
            }
            Ok(ServerInbound::ClientLevelStarted(_)) => self.on_level_started(channel),
            Ok(ServerInbound::Heartbeat(_)) => log::trace!("heartbeat from {}", channel),
            Err(MessageError::UnknownType(hash)) if joined => {
                log::trace!("forwarding message {:#010x} from {}", hash, channel);
                self.pending_events.push_back(ServerEvent::Message {
                    channel,
                    delivery,
                    payload,
                });
            }
            Err(MessageError::UnknownType(hash)) => {
                log::warn!("{} sent message {:#010x} before its handshake", channel, hash);
            }
            Err(e) => {
                log::warn!("malformed message from {}: {}", channel, e);
                self.pending_events
                    .push_back(ServerEvent::InvalidMessage { channel });
                self.close_peer(channel, DisconnectReason::Error, e.to_string());
            }
        }
    }

    fn on_client_connect(&mut self, channel: ChannelId, connect: ClientConnect) {
        let Some(peer) = self.peers.get_mut(&channel) else {
            return;
        };
        if peer.did_handshake {
            log::debug!("ignoring repeated ClientConnect from {}", channel);
            return;
        }
        if connect.version != self.config.build_id {
            log::warn!(
                "{} runs version {}, expected {}",
                channel,
                connect.version,
                self.config.build_id
            );
            let detail = self.config.build_id.clone();
            self.close_peer(channel, DisconnectReason::WrongVersion, detail);
            return;
        }

        let identity = connect.identity();
        peer.did_handshake = true;
        peer.pending_connect = false;
        peer.identity = Some(identity);
        peer.version = Some(connect.version.clone());
        log::info!("{} joined as {}", channel, identity);
        self.pending_events.push_back(ServerEvent::ClientJoined {
            channel,
            identity,
            version: connect.version,
        });

        if let Some(level) = self.current_level.clone() {
            self.send_travel(channel, level, Vec::new());
        }
    }

    fn on_finished_travel(&mut self, channel: ChannelId, finished: ClientFinishedTravel) {
        let Some(target) = self.current_level.clone() else {
            return;
        };
        if finished.level != target {
            log::debug!(
                "{} finished travel to {} but the server is on {}, resending",
                channel,
                finished.level,
                target
            );
            self.send_travel(channel, target, self.keep_alive_ids.clone());
            return;
        }

        let Some(peer) = self.peers.get_mut(&channel) else {
            return;
        };
        peer.client_level = Some(target.clone());
        peer.is_traveling = false;
        self.pending_events.push_back(ServerEvent::ClientTraveled {
            channel,
            level: target,
        });
    }

    fn on_level_started(&mut self, channel: ChannelId) {
        let Some(peer) = self.peers.get_mut(&channel) else {
            return;
        };
        let Some(level) = peer
            .client_level
            .clone()
            .filter(|level| Some(level.as_str()) == self.current_level.as_deref())
        else {
            log::debug!("ignoring level start from {} outside the current level", channel);
            return;
        };
        if peer.level_started {
            return;
        }
        peer.level_started = true;
        log::info!("{} started {}", channel, level);
        self.pending_events
            .push_back(ServerEvent::LevelStarted { channel, level });
    }

    fn send_travel(&mut self, channel: ChannelId, level: String, keep_alive_ids: Vec<u32>) {
        let Some(peer) = self.peers.get_mut(&channel) else {
            return;
        };
        peer.is_traveling = true;
        peer.client_level = None;
        peer.level_started = false;
        peer.known_actors.retain(|id| keep_alive_ids.contains(id));

        let travel = ClientTravel {
            level,
            keep_alive_ids,
        };
        match self.send(channel, Delivery::Reliable, &travel) {
            Ok(()) => self.pending_events.push_back(ServerEvent::TravelIssued {
                channel,
                level: travel.level,
            }),
            Err(e) => log::warn!("failed to send travel to {}: {}", channel, e),
        }
    }

    fn expire_connections(&mut self, now: Instant) {
        let handshake_timeout = self.config.handshake_timeout();
        let idle_timeout = self.config.idle_timeout();

        let expired: Vec<(ChannelId, String)> = self
            .peers
            .values()
            .filter(|peer| peer.closing.is_none())
            .filter_map(|peer| {
                if !peer.did_handshake {
                    let waited = now.saturating_duration_since(peer.connected_at);
                    (waited > handshake_timeout).then(|| {
                        (
                            peer.channel(),
                            format!("no handshake after {:.1}s", waited.as_secs_f32()),
                        )
                    })
                } else {
                    let idle = now.saturating_duration_since(peer.last_heard);
                    (idle > idle_timeout).then(|| {
                        (
                            peer.channel(),
                            format!("idle for {:.1}s", idle.as_secs_f32()),
                        )
                    })
                }
            })
            .collect();

        for (channel, detail) in expired {
            log::warn!("{} timed out: {}", channel, detail);
            self.close_peer(channel, DisconnectReason::TimedOut, detail);
        }
    }

    /// Tells the peer why it is being dropped, then drops it.
    fn close_peer(&mut self, channel: ChannelId, reason: DisconnectReason, detail: String) {
        let Some(peer) = self.peers.get_mut(&channel) else {
            return;
        };
        if peer.closing.is_some() {
            return;
        }
        peer.closing = Some((reason, detail.clone()));

        let disconnect = Disconnect { reason, detail };
        if let Err(e) = self.send(channel, Delivery::Reliable, &disconnect) {
            log::debug!("could not deliver disconnect to {}: {}", channel, e);
        }
        self.driver.disconnect(channel);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::net::{LoopbackDriver, loopback::LOOPBACK_CHANNEL};
    use crate::session::{ClientInbound, ClientLevelStarted, Heartbeat, client_registry};

    struct Harness {
        session: ServerSession,
        client: LoopbackDriver,
        writer: MessageWriter,
    }

    impl Harness {
        fn new(config: ServerConfig) -> Self {
            let (host, mut client) = LoopbackDriver::pair(64 * 1024);
            let mut session = ServerSession::new(config, Box::new(host)).unwrap();
            session.listen(0).unwrap();
            client.connect("localhost", 0).unwrap();
            session.tick();
            client.tick_client();
            Self {
                session,
                client,
                writer: MessageWriter::new(),
            }
        }

        fn send<M: Message>(&mut self, message: &M) {
            let frame = self.writer.write(message).unwrap().to_vec();
            self.client.send_reliable(LOOPBACK_CHANNEL, &frame).unwrap();
            self.session.tick();
        }

        fn received(&mut self) -> Vec<ClientInbound> {
            let registry = client_registry().unwrap();
            self.client.tick_client();
            std::iter::from_fn(|| self.client.poll_event())
                .filter_map(|event| match event {
                    DriverEvent::Message { payload, .. } => registry.decode(&payload).ok(),
                    _ => None,
                })
                .collect()
        }

        fn events(&mut self) -> Vec<ServerEvent> {
            self.session.drain_events().collect()
        }

        fn join(&mut self) {
            let connect = ClientConnect::new(self.session.config().build_id.clone(), Uuid::new_v4());
            self.send(&connect);
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            build_id: "v1.0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_welcome_then_join_then_travel() {
        let mut harness = Harness::new(config());
        harness.session.travel("Level_Foo", Vec::new());

        let received = harness.received();
        let [ClientInbound::Welcome(welcome)] = received.as_slice() else {
            panic!("expected a welcome, got {:?}", received);
        };
        assert_eq!(welcome.connection_id, 1);

        harness.join();
        let peer = harness.session.peer(LOOPBACK_CHANNEL).unwrap();
        assert!(peer.did_handshake);
        assert!(!peer.pending_connect);
        assert!(peer.is_traveling);
        assert_eq!(
            harness.received(),
            vec![ClientInbound::ClientTravel(ClientTravel {
                level: "Level_Foo".to_string(),
                keep_alive_ids: Vec::new(),
            })]
        );
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let mut harness = Harness::new(config());
        harness.received();

        harness.send(&ClientConnect::new("v0.9", Uuid::new_v4()));

        assert_eq!(
            harness.received(),
            vec![ClientInbound::Disconnect(Disconnect {
                reason: DisconnectReason::WrongVersion,
                detail: "v1.0".to_string(),
            })]
        );
        assert_eq!(harness.session.connection_count(), 0);
        assert!(harness.events().contains(&ServerEvent::ClientDisconnected {
            channel: LOOPBACK_CHANNEL,
            connection_id: 1,
            reason: DisconnectReason::WrongVersion,
            detail: "v1.0".to_string(),
        }));
    }

    #[test]
    fn test_level_start_gates_replication() {
        let mut harness = Harness::new(config());
        harness.session.travel("Level_Foo", Vec::new());
        harness.join();

        assert!(!harness
            .session
            .send_replicated(LOOPBACK_CHANNEL, Delivery::Reliable, &ClientLevelStarted)
            .unwrap());

        // Started before finishing travel: ignored.
        harness.send(&ClientLevelStarted);
        assert!(!harness.session.peer(LOOPBACK_CHANNEL).unwrap().level_started);

        harness.send(&ClientFinishedTravel {
            level: "Level_Foo".to_string(),
        });
        harness.send(&ClientLevelStarted);
        assert!(harness.session.peer(LOOPBACK_CHANNEL).unwrap().level_started);
        assert_eq!(
            harness
                .session
                .broadcast_replicated(Delivery::Unreliable, &ClientLevelStarted),
            1
        );
    }

    #[test]
    fn test_stale_finished_travel_is_corrected() {
        let mut harness = Harness::new(config());
        harness.session.travel("Level_Foo", Vec::new());
        harness.join();
        harness.received();

        harness.session.travel("Level_Bar", vec![7]);
        harness.send(&ClientFinishedTravel {
            level: "Level_Foo".to_string(),
        });

        assert_eq!(
            harness.received(),
            vec![ClientInbound::ClientTravel(ClientTravel {
                level: "Level_Bar".to_string(),
                keep_alive_ids: vec![7],
            })]
        );
        assert_eq!(harness.session.peer(LOOPBACK_CHANNEL).unwrap().client_level, None);
    }

    #[test]
    fn test_travel_prunes_known_actors() {
        let mut harness = Harness::new(config());
        harness.session.travel("Level_Foo", Vec::new());
        harness.join();
        harness.send(&ClientFinishedTravel {
            level: "Level_Foo".to_string(),
        });

        assert!(harness.session.mark_replicated(LOOPBACK_CHANNEL, 3));
        assert!(harness.session.mark_replicated(LOOPBACK_CHANNEL, 4));
        assert!(!harness.session.mark_replicated(LOOPBACK_CHANNEL, 4));

        harness.session.travel("Level_Bar", vec![4]);
        let peer = harness.session.peer(LOOPBACK_CHANNEL).unwrap();
        assert!(peer.knows_actor(4));
        assert!(!peer.knows_actor(3));
        assert_eq!(peer.known_actors().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_idle_timeout_after_heartbeats_stop() {
        let mut harness = Harness::new(ServerConfig {
            idle_timeout_ms: 100,
            ..config()
        });
        harness.join();
        let joined_at = harness.session.peer(LOOPBACK_CHANNEL).unwrap().last_heard();

        thread::sleep(Duration::from_millis(5));
        harness.send(&Heartbeat);
        let peer = harness.session.peer(LOOPBACK_CHANNEL).unwrap();
        assert!(peer.last_heard() > joined_at);
        harness.received();
        harness.events();

        thread::sleep(Duration::from_millis(150));
        harness.session.tick();

        assert_eq!(harness.session.connection_count(), 0);
        let events = harness.events();
        let detail = events
            .iter()
            .find_map(|event| match event {
                ServerEvent::ClientDisconnected {
                    reason: DisconnectReason::TimedOut,
                    detail,
                    ..
                } => Some(detail.clone()),
                _ => None,
            })
            .unwrap();
        assert!(detail.starts_with("idle for "), "{}", detail);
        assert!(matches!(
            harness.received().as_slice(),
            [ClientInbound::Disconnect(Disconnect {
                reason: DisconnectReason::TimedOut,
                ..
            })]
        ));
    }

    #[test]
    fn test_handshake_timeout() {
        let mut harness = Harness::new(ServerConfig {
            handshake_timeout_ms: 1,
            ..config()
        });
        thread::sleep(Duration::from_millis(5));
        harness.session.tick();

        assert_eq!(harness.session.connection_count(), 0);
        let events = harness.events();
        assert!(events.iter().any(|event| matches!(
            event,
            ServerEvent::ClientDisconnected {
                reason: DisconnectReason::TimedOut,
                ..
            }
        )));
    }

    #[test]
    fn test_shutdown_kicks_everyone_once() {
        let mut harness = Harness::new(config());
        harness.join();
        harness.events();

        harness.session.shutdown();
        harness.session.shutdown();

        let disconnects: Vec<_> = harness
            .events()
            .into_iter()
            .filter(|event| matches!(event, ServerEvent::ClientDisconnected { .. }))
            .collect();
        assert_eq!(disconnects.len(), 1);
        assert!(matches!(
            disconnects[0],
            ServerEvent::ClientDisconnected {
                reason: DisconnectReason::User,
                ..
            }
        ));
    }
}
