use std::path::Path;

use serde::{Deserialize, Serialize};
use tether::{ConfigError, DEFAULT_PORT, ServerConfig, load_toml};

pub const DEFAULT_LEVEL: &str = "Lobby";

/// Everything the dedicated host needs on top of the session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub port: u16,
    /// Levels visited in order. The host starts on the first one.
    pub levels: Vec<String>,
    /// Seconds spent on each level before traveling to the next. Zero disables rotation.
    pub level_duration_secs: u64,
    /// Simulated load time of the in-process participant.
    pub local_load_ms: u64,
    #[serde(flatten)]
    pub session: ServerConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            levels: vec![DEFAULT_LEVEL.to_string()],
            level_duration_secs: 0,
            local_load_ms: 250,
            session: ServerConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = load_toml(path)?;
        if config.levels.is_empty() {
            config.levels.push(DEFAULT_LEVEL.to_string());
        }
        Ok(config)
    }
}
