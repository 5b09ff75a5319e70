use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::net::{DriverKind, PacketLossSimulation};

/// Version string exchanged in `ClientConnect` and checked by the server.
pub const BUILD_ID: &str = concat!("tether-", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_PORT: u16 = 7777;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub handshake_timeout_ms: u64,
    pub handshake_retry_ms: u64,
    pub connect_timeout_ms: u64,
    pub receive_capacity: usize,
    pub send_retry_limit: u32,
    pub loopback_capacity: usize,
    pub platform_queue_capacity: usize,
    pub unreliable_simulation: PacketLossSimulation,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            handshake_retry_ms: 500,
            connect_timeout_ms: 5_000,
            receive_capacity: u16::MAX as usize,
            send_retry_limit: 8,
            loopback_capacity: 256 * 1024,
            platform_queue_capacity: 1024,
            unreliable_simulation: PacketLossSimulation::default(),
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_name: String,
    pub motd: String,
    pub build_id: String,
    pub max_clients: usize,
    pub tick_rate: u32,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub driver: DriverKind,
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "Host".to_string(),
            motd: "Welcome".to_string(),
            build_id: BUILD_ID.to_string(),
            max_clients: 32,
            tick_rate: 60,
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            driver: DriverKind::Hybrid,
            transport: TransportConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub version: String,
    pub identity: Uuid,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub driver: DriverKind,
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: BUILD_ID.to_string(),
            identity: Uuid::new_v4(),
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            driver: DriverKind::Hybrid,
            transport: TransportConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
