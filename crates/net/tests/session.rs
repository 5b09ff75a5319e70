use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rkyv::{Archive, Deserialize, Serialize};
use tether::message::{MessageRegistry, MessageType, Side, Sides};
use tether::session::{ClientEvent, ClientState, DisconnectReason, ServerEvent};
use tether::{
    ClientConfig, ClientSession, Delivery, DriverKind, ServerConfig, ServerSession,
    TransportConfig, create_colocated, rkyv_message,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(42000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct ActorSnapshot {
    actor_id: u32,
    position: [i32; 3],
}

rkyv_message!(ActorSnapshot, "tests.game.ActorSnapshot", Sides::CLIENT);

struct World {
    server: ServerSession,
    client: ClientSession,
    port: u16,
    server_events: Vec<ServerEvent>,
    client_events: Vec<ClientEvent>,
}

impl World {
    fn new(kind: DriverKind, client_version: &str) -> Self {
        let port = match kind {
            DriverKind::Hybrid => next_port(),
            _ => 7777,
        };
        let (host, participant) = create_colocated(kind, &TransportConfig::default());
        let server = ServerSession::new(
            ServerConfig {
                server_name: "Host".to_string(),
                motd: "hi".to_string(),
                build_id: "v1.0".to_string(),
                max_clients: 4,
                ..Default::default()
            },
            host,
        )
        .unwrap();
        let client = ClientSession::new(
            ClientConfig {
                version: client_version.to_string(),
                ..Default::default()
            },
            participant,
        )
        .unwrap();
        Self {
            server,
            client,
            port,
            server_events: Vec::new(),
            client_events: Vec::new(),
        }
    }

    fn start(&mut self) {
        self.server.listen(self.port).unwrap();
        self.client.connect("127.0.0.1", self.port).unwrap();
    }

    fn tick(&mut self) {
        self.server.tick();
        self.client.tick();
        self.server_events.extend(self.server.drain_events());
        self.client_events.extend(self.client.drain_events());
    }

    fn tick_until(&mut self, what: &str, done: impl Fn(&Self) -> bool) {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(3) {
            self.tick();
            if done(self) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!(
            "timed out waiting for {}\nserver: {:?}\nclient: {:?}",
            what, self.server_events, self.client_events
        );
    }

    fn travel_requests(&self) -> Vec<String> {
        self.client_events
            .iter()
            .filter_map(|event| match event {
                ClientEvent::TravelRequested { level, .. } => Some(level.clone()),
                _ => None,
            })
            .collect()
    }
}

fn run_join_scenario(kind: DriverKind) {
    let mut world = World::new(kind, "v1.0");
    world.server.travel("Level_Foo", Vec::new());
    world.start();

    world.tick_until("welcome", |world| {
        world.client_events.contains(&ClientEvent::Welcomed {
            server_name: "Host".to_string(),
            message: "hi".to_string(),
            connection_id: 1,
        })
    });

    world.tick_until("travel request", |world| !world.travel_requests().is_empty());
    assert_eq!(world.travel_requests(), vec!["Level_Foo".to_string()]);
    assert_eq!(world.client.state(), ClientState::Joining);

    let channel = world.server.peers().next().map(|peer| peer.channel()).unwrap();
    let peer = world.server.peer(channel).unwrap();
    assert!(peer.did_handshake);
    assert!(peer.is_traveling);
    assert_eq!(peer.identity(), Some(world.client.identity()));

    let snapshot = ActorSnapshot {
        actor_id: 12,
        position: [1, 2, 3],
    };
    assert!(
        !world
            .server
            .send_replicated(channel, Delivery::Reliable, &snapshot)
            .unwrap()
    );

    world.client.finish_travel().unwrap();
    world.client.notify_level_started().unwrap();
    world.tick_until("level start", |world| {
        world.server_events.iter().any(|event| {
            matches!(event, ServerEvent::LevelStarted { level, .. } if level == "Level_Foo")
        })
    });
    assert_eq!(world.client.state(), ClientState::Connected);
    assert!(world.server.peer(channel).unwrap().level_started);

    assert_eq!(world.server.broadcast_replicated(Delivery::Reliable, &snapshot), 1);
    world.tick_until("replication", |world| {
        world
            .client_events
            .iter()
            .any(|event| matches!(event, ClientEvent::Message { .. }))
    });

    let game: MessageRegistry<ActorSnapshot> = MessageRegistry::build(
        Side::Client,
        vec![MessageType::of(|snapshot: ActorSnapshot| snapshot)],
    )
    .unwrap();
    let payload = world
        .client_events
        .iter()
        .find_map(|event| match event {
            ClientEvent::Message { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(game.decode(&payload).unwrap(), snapshot);

    world.client.disconnect();
    world.tick_until("server disconnect", |world| {
        world.server_events.iter().any(|event| {
            matches!(
                event,
                ServerEvent::ClientDisconnected {
                    reason: DisconnectReason::User,
                    ..
                }
            )
        })
    });
    assert_eq!(world.server.connection_count(), 0);
}

#[test]
fn test_join_scenario_over_hybrid_sockets() {
    run_join_scenario(DriverKind::Hybrid);
}

#[test]
fn test_join_scenario_over_builtin_platform() {
    run_join_scenario(DriverKind::Builtin);
}

#[test]
fn test_join_scenario_over_loopback() {
    run_join_scenario(DriverKind::Loopback);
}

#[test]
fn test_travel_converges_after_stale_finish() {
    let mut world = World::new(DriverKind::Loopback, "v1.0");
    world.server.travel("Level_Foo", Vec::new());
    world.start();
    world.tick_until("travel request", |world| !world.travel_requests().is_empty());

    // The server moves on while the client is still loading Level_Foo.
    world.server.travel("Level_Bar", Vec::new());
    world.client.finish_travel().unwrap();
    world.tick_until("second travel request", |world| world.travel_requests().len() == 2);
    assert_eq!(
        world.travel_requests(),
        vec!["Level_Foo".to_string(), "Level_Bar".to_string()]
    );

    // Level start is refused while a travel is still pending.
    world.client.notify_level_started().unwrap_err();
    world.client.finish_travel().unwrap();
    world.client.notify_level_started().unwrap();
    world.tick_until("level start", |world| {
        world.server_events.iter().any(|event| {
            matches!(event, ServerEvent::LevelStarted { level, .. } if level == "Level_Bar")
        })
    });
}

#[test]
fn test_version_mismatch_disconnects_both_sides() {
    for kind in [DriverKind::Loopback, DriverKind::Builtin, DriverKind::Hybrid] {
        let mut world = World::new(kind, "v0.9");
        world.start();

        world.tick_until("client rejection", |world| {
            world.client.state() == ClientState::Disconnected
                && world.server_events.iter().any(|event| {
                    matches!(event, ServerEvent::ClientDisconnected { .. })
                })
        });

        assert!(world.client_events.contains(&ClientEvent::Disconnected {
            reason: DisconnectReason::WrongVersion,
            detail: "v1.0".to_string(),
        }));
        assert!(world.server_events.iter().any(|event| matches!(
            event,
            ServerEvent::ClientDisconnected {
                reason: DisconnectReason::WrongVersion,
                ..
            }
        )));
    }
}
