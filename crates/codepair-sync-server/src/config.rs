use std::path::Path;
use std::time::Duration;

use codepair_common::ConfigError;
use codepair_common::config::load_toml;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
    /// How long a room with no connections keeps its document.
    pub room_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl ServerConfig {
    pub fn room_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.room_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1234".into(),
            max_message_size: 16 * 1024 * 1024,
            room_idle_timeout_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
}

impl Config {
    /// Load from a TOML file, substituting `$VAR`s from the environment.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        match load_toml(path.as_ref()) {
            Err(ConfigError::Read { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                tracing::info!(path = %path.as_ref().display(), "no config file, using defaults");
                Ok(Config::default())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/codepair-sync.toml").unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:1234");
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str("[server]\nlisten_addr = \"127.0.0.1:9000\"\n").unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.server.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.server.room_idle_timeout(), Duration::from_secs(3600));
    }
}
