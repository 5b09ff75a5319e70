use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::Level;
use tether::{
    ChannelId, ClientConfig, ClientEvent, ClientSession, DisconnectReason, DriverKind, IoMetrics,
    ServerEvent, ServerSession, create_colocated, create_driver,
};

use crate::config::HostConfig;

const METRICS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: Level,
    pub message: String,
}

impl LogLine {
    fn info(message: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            message: message.into(),
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            level: Level::Warn,
            message: message.into(),
        }
    }
}

/// Participant living in the host process, reachable only through a
/// colocated driver.
struct LocalParticipant {
    session: ClientSession,
    load_time: Duration,
    loading_since: Option<Instant>,
}

impl LocalParticipant {
    fn tick(&mut self, log: &mut VecDeque<LogLine>) {
        self.session.tick();

        let events: Vec<ClientEvent> = self.session.drain_events().collect();
        for event in events {
            match event {
                ClientEvent::TravelRequested { level, .. } => {
                    log.push_back(LogLine::info(format!("local participant loading {}", level)));
                    self.loading_since = Some(Instant::now());
                }
                ClientEvent::Disconnected { reason, detail } => {
                    log.push_back(LogLine::warn(format!(
                        "local participant left: {} {}",
                        reason, detail
                    )));
                    self.loading_since = None;
                }
                _ => {}
            }
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
            if let Err(e) = started {
                log.push_back(LogLine::warn(format!("local participant: {}", e)));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostStats {
    pub uptime_secs: u64,
    pub tick: u64,
    pub driver: DriverKind,
    pub level: Option<String>,
    pub next_travel_secs: Option<u64>,
    pub connection_count: usize,
    pub max_clients: usize,
    /// Traffic since the host started.
    pub metrics: IoMetrics,
    /// Traffic during the last full metrics interval.
    pub rates: IoMetrics,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub channel: ChannelId,
    pub connection_id: u32,
    pub address: String,
    pub version: Option<String>,
    pub level: Option<String>,
    pub phase: &'static str,
    pub connected_secs: u64,
    pub idle_secs: u64,
    pub metrics: IoMetrics,
}

/// Dedicated host: one server session, an optional in-process participant
/// and the level rotation.
pub struct Host {
    session: ServerSession,
    local: Option<LocalParticipant>,
    levels: Vec<String>,
    level_index: usize,
    level_duration: Option<Duration>,
    level_since: Instant,
    tick: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    start_time: Instant,
    pending_log: VecDeque<LogLine>,
    traffic: IoMetrics,
    last_interval: IoMetrics,
    interval_since: Instant,
}

impl Host {
    pub fn new(config: HostConfig) -> Result<Self> {
        let kind = config.session.driver;
        let transport = config.session.transport.clone();
        let (driver, local_driver) = match kind {
            DriverKind::Hybrid => (create_driver(kind, &transport)?, None),
            DriverKind::Builtin | DriverKind::Loopback => {
                let (host, participant) = create_colocated(kind, &transport);
                (host, Some(participant))
            }
        };

        let mut session = ServerSession::new(config.session.clone(), driver)?;
        session
            .listen(config.port)
            .with_context(|| format!("failed to listen on port {}", config.port))?;

        let local = match local_driver {
            Some(driver) => {
                let client_config = ClientConfig {
                    version: config.session.build_id.clone(),
                    driver: kind,
                    transport,
                    ..Default::default()
                };
                let mut participant = ClientSession::new(client_config, driver)?;
                participant.connect("localhost", config.port)?;
                Some(LocalParticipant {
                    session: participant,
                    load_time: Duration::from_millis(config.local_load_ms),
                    loading_since: None,
                })
            }
            None => None,
        };

        let levels = if config.levels.is_empty() {
            vec![crate::config::DEFAULT_LEVEL.to_string()]
        } else {
            config.levels
        };
        session.travel(levels[0].clone(), Vec::new());

        let now = Instant::now();
        Ok(Self {
            session,
            local,
            levels,
            level_index: 0,
            level_duration: (config.level_duration_secs > 0)
                .then(|| Duration::from_secs(config.level_duration_secs)),
            level_since: now,
            tick: 0,
            tick_duration: config.session.tick_duration(),
            last_tick_time: now,
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            start_time: now,
            pending_log: VecDeque::new(),
            traffic: IoMetrics::default(),
            last_interval: IoMetrics::default(),
            interval_since: now,
        })
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn port(&self) -> Option<u16> {
        self.session.driver().local_addr().map(|addr| addr.port())
    }

    pub fn drain_log(&mut self) -> impl Iterator<Item = LogLine> + '_ {
        self.pending_log.drain(..)
    }

    /// Runs until the running flag is cleared, logging through `log`.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for line in self.drain_log() {
                log::log!(line.level, "{}", line.message);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
        for line in self.drain_log() {
            log::log!(line.level, "{}", line.message);
        }
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        self.session.tick();
        self.collect_events();
        if let Some(local) = &mut self.local {
            local.tick(&mut self.pending_log);
        }
        if self.interval_since.elapsed() >= METRICS_INTERVAL {
            self.sample_metrics();
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick += 1;
            self.rotate_levels();
        }
    }

    /// Moves every participant to the next level in the rotation.
    pub fn next_level(&mut self) {
        self.level_index = (self.level_index + 1) % self.levels.len();
        self.level_since = Instant::now();
        let level = self.levels[self.level_index].clone();
        self.pending_log
            .push_back(LogLine::info(format!("traveling to {}", level)));
        self.session.travel(level, Vec::new());
        self.collect_events();
    }

    pub fn kick(&mut self, channel: ChannelId) {
        self.session
            .kick(channel, DisconnectReason::User, "kicked by host");
        self.collect_events();
    }

    pub fn shutdown(&mut self) {
        self.pending_log.push_back(LogLine::info("shutting down"));
        if let Some(local) = &mut self.local {
            local.session.disconnect();
        }
        self.session.shutdown();
        self.collect_events();
    }

    /// Folds the driver's counters into the running totals and starts a new
    /// interval.
    fn sample_metrics(&mut self) {
        let taken = self.session.driver_mut().take_metrics();
        self.traffic += taken;
        self.last_interval = taken;
        self.interval_since = Instant::now();
    }

    pub fn stats(&self) -> HostStats {
        let mut metrics = self.traffic;
        metrics += self.session.driver().metrics();
        HostStats {
            uptime_secs: self.start_time.elapsed().as_secs(),
            tick: self.tick,
            driver: self.session.driver().kind(),
            level: self.session.current_level().map(str::to_string),
            next_travel_secs: self.level_duration.map(|duration| {
                duration
                    .saturating_sub(self.level_since.elapsed())
                    .as_secs()
            }),
            connection_count: self.session.connection_count(),
            max_clients: self.session.config().max_clients,
            metrics,
            rates: self.last_interval,
        }
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        let driver = self.session.driver();
        self.session
            .peers()
            .map(|peer| PeerInfo {
                channel: peer.channel(),
                connection_id: peer.connection_id(),
                address: peer.address().to_string(),
                version: peer.version().map(str::to_string),
                level: peer.client_level.clone(),
                phase: if !peer.did_handshake {
                    "handshake"
                } else if peer.is_traveling {
                    "traveling"
                } else if peer.level_started {
                    "playing"
                } else {
                    "loading"
                },
                connected_secs: peer.connected_at().elapsed().as_secs(),
                idle_secs: peer.last_heard().elapsed().as_secs(),
                metrics: driver
                    .connection_info(peer.channel())
                    .map(|info| info.metrics)
                    .unwrap_or_default(),
            })
            .collect()
    }

    fn rotate_levels(&mut self) {
        let Some(duration) = self.level_duration else {
            return;
        };
        if self.levels.len() > 1 && self.level_since.elapsed() >= duration {
            self.next_level();
        }
    }

    fn collect_events(&mut self) {
        let events: Vec<ServerEvent> = self.session.drain_events().collect();
        for event in events {
            if let Some(line) = describe(event) {
                self.pending_log.push_back(line);
            }
        }
    }
}

fn describe(event: ServerEvent) -> Option<LogLine> {
    let line = match event {
        ServerEvent::ClientConnected {
            channel,
            connection_id,
            address,
        } => LogLine::info(format!(
            "connection {} ({}) opened from {}",
            connection_id, channel, address
        )),
        ServerEvent::ClientJoined {
            channel,
            identity,
            version,
        } => LogLine::info(format!("{} joined as {} ({})", channel, identity, version)),
        ServerEvent::TravelIssued { channel, level } => {
            LogLine::info(format!("{} told to travel to {}", channel, level))
        }
        ServerEvent::ClientTraveled { channel, level } => {
            LogLine::info(format!("{} finished loading {}", channel, level))
        }
        ServerEvent::LevelStarted { channel, level } => {
            LogLine::info(format!("{} started {}", channel, level))
        }
        ServerEvent::ClientDisconnected {
            connection_id,
            reason,
            detail,
            ..
        } => {
            let message = if detail.is_empty() {
                format!("connection {} closed: {}", connection_id, reason)
            } else {
                format!("connection {} closed: {} ({})", connection_id, reason, detail)
            };
            match reason {
                DisconnectReason::User => LogLine::info(message),
                _ => LogLine::warn(message),
            }
        }
        ServerEvent::InvalidMessage { channel } => {
            LogLine::warn(format!("invalid message from {}", channel))
        }
        ServerEvent::Message { .. } => return None,
    };
    Some(line)
}
