use std::time::{Duration, Instant};

use tether::{ClientEvent, ClientSession, DisconnectReason};

/// Drives a [`ClientSession`] the way a game would: every requested level
/// takes `load_time` to load, then the level is reported as started.
pub struct Participant {
    session: ClientSession,
    load_time: Duration,
    loading_since: Option<Instant>,
    messages_received: u64,
}

impl Participant {
    pub fn new(session: ClientSession, load_time: Duration) -> Self {
        Self {
            session,
            load_time,
            loading_since: None,
            messages_received: 0,
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn leave(&mut self) {
        self.session.disconnect();
    }

    /// Returns the reason once the session has ended.
    pub fn tick(&mut self) -> Option<(DisconnectReason, String)> {
        self.session.tick();

        let mut ended = None;
        let events: Vec<ClientEvent> = self.session.drain_events().collect();
        for event in events {
            match event {
                ClientEvent::TransportConnected { channel } => {
                    log::debug!("transport up on {}", channel);
                }
                ClientEvent::Welcomed {
                    server_name,
                    message,
                    connection_id,
                } => {
                    log::info!(
                        "joined {} as connection {}: {}",
                        server_name,
                        connection_id,
                        message
                    );
                }
                ClientEvent::TravelRequested {
                    level,
                    keep_alive_ids,
                } => {
                    log::info!(
                        "loading {} (keeping {} actors)",
                        level,
                        keep_alive_ids.len()
                    );
                    self.loading_since = Some(Instant::now());
                }
                ClientEvent::Message { delivery, payload } => {
                    self.messages_received += 1;
                    log::trace!("{:?} game message, {} bytes", delivery, payload.len());
                }
                ClientEvent::InvalidMessage => log::warn!("server sent an invalid message"),
                ClientEvent::Disconnected { reason, detail } => {
                    self.loading_since = None;
                    ended = Some((reason, detail));
                }
            }
        }
        if ended.is_some() {
            return ended;
        }

        let loaded = self
            .loading_since
            .is_some_and(|since| since.elapsed() >= self.load_time);
        if loaded {
            self.loading_since = None;
            let started = self
                .session
                .finish_travel()
                .and_then(|()| self.session.notify_level_started());
            match started {
                Ok(()) => log::info!(
                    "level {} started",
                    self.session.level().unwrap_or_default()
                ),
                Err(e) => log::warn!("could not start the level: {}", e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tether::{
        ClientConfig, ClientState, DriverKind, ServerConfig, ServerEvent, ServerSession,
        TransportConfig, create_colocated,
    };

    use super::*;

    fn colocated() -> (ServerSession, Participant) {
        let (host, driver) = create_colocated(DriverKind::Loopback, &TransportConfig::default());
        let mut server = ServerSession::new(ServerConfig::default(), host).unwrap();
        server.listen(7777).unwrap();
        server.travel("Level_Foo", Vec::new());

        let mut session = ClientSession::new(ClientConfig::default(), driver).unwrap();
        session.connect("localhost", 7777).unwrap();
        (server, Participant::new(session, Duration::from_millis(5)))
    }

    #[test]
    fn test_participant_loads_and_starts_level() {
        let (mut server, mut participant) = colocated();

        let start = Instant::now();
        let mut started = false;
        while start.elapsed() < Duration::from_secs(3) && !started {
            server.tick();
            assert_eq!(participant.tick(), None);
            started = server
                .drain_events()
                .any(|event| matches!(event, ServerEvent::LevelStarted { .. }));
            thread::sleep(Duration::from_millis(1));
        }

        assert!(started);
        assert_eq!(participant.session().state(), ClientState::Connected);
        assert_eq!(participant.session().level(), Some("Level_Foo"));
    }

    #[test]
    fn test_kick_ends_the_participant() {
        let (mut server, mut participant) = colocated();

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(3) && server.connection_count() == 0 {
            server.tick();
            participant.tick();
            thread::sleep(Duration::from_millis(1));
        }
        let channel = server.peers().next().map(|peer| peer.channel()).unwrap();
        server.kick(channel, DisconnectReason::User, "bye");

        let mut ended = None;
        for _ in 0..10 {
            ended = participant.tick();
            if ended.is_some() {
                break;
            }
        }
        assert_eq!(ended, Some((DisconnectReason::User, "bye".to_string())));
    }
}
