//! Client configuration and config-file helpers.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use url::Url;

use crate::error::ConfigError;

/// Configuration for a collaborating client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// WebSocket base URL of the sync relay (e.g., `ws://localhost:1234`).
    pub sync_url: Url,
    /// Base URL of the session service REST API, including the version prefix.
    pub api_url: Url,
    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Quiet period after the last keystroke before "stopped typing".
    pub typing_quiet_period: Duration,
    /// Wall-clock limit for a single code execution.
    pub execution_timeout: Duration,
    /// Longest source text accepted by the sandbox, in chars.
    pub max_code_length: usize,
    /// Mirror local edits to the session service while synced.
    pub persist_text: bool,
}

impl ClientConfig {
    pub const DEFAULT_SYNC_URL: &'static str = "ws://localhost:1234";
    pub const DEFAULT_API_URL: &'static str = "http://localhost:8000/api/v1/";

    /// Load configuration from environment variables.
    ///
    /// Optional env vars (defaults in parentheses):
    /// - `CODEPAIR_SYNC_URL` (ws://localhost:1234)
    /// - `CODEPAIR_API_URL` (http://localhost:8000/api/v1/)
    /// - `CODEPAIR_RECONNECT_MS` (3000)
    /// - `CODEPAIR_TYPING_QUIET_MS` (500)
    /// - `CODEPAIR_EXEC_TIMEOUT_SECS` (5)
    /// - `CODEPAIR_MAX_CODE_LEN` (10000)
    /// - `CODEPAIR_PERSIST_TEXT` (true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let sync_url = match std::env::var("CODEPAIR_SYNC_URL") {
            Ok(raw) => parse_url(&raw)?,
            Err(_) => defaults.sync_url,
        };
        let api_url = match std::env::var("CODEPAIR_API_URL") {
            Ok(raw) => parse_url(&normalize_base(&raw))?,
            Err(_) => defaults.api_url,
        };

        Ok(Self {
            sync_url,
            api_url,
            reconnect_interval: env_parse::<u64>("CODEPAIR_RECONNECT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_interval),
            typing_quiet_period: env_parse::<u64>("CODEPAIR_TYPING_QUIET_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_quiet_period),
            execution_timeout: env_parse::<u64>("CODEPAIR_EXEC_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.execution_timeout),
            max_code_length: env_parse::<usize>("CODEPAIR_MAX_CODE_LEN")?
                .unwrap_or(defaults.max_code_length),
            persist_text: env_parse::<bool>("CODEPAIR_PERSIST_TEXT")?
                .unwrap_or(defaults.persist_text),
        })
    }

    /// Transport settings derived from this config.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            reconnect_interval: self.reconnect_interval,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync_url: Url::parse(Self::DEFAULT_SYNC_URL).expect("default sync URL is valid"),
            api_url: Url::parse(Self::DEFAULT_API_URL).expect("default API URL is valid"),
            reconnect_interval: Duration::from_secs(3),
            typing_quiet_period: Duration::from_millis(500),
            execution_timeout: Duration::from_secs(5),
            max_code_length: 10_000,
            persist_text: true,
        }
    }
}

/// Settings for the connection pool.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Fixed delay between reconnect attempts. A new attempt never starts
    /// sooner than this after the previous one started.
    pub reconnect_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
        }
    }
}

/// Load a TOML config file, substituting `$VAR` references from the environment.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let substituted = substitute_env(&raw, std::env::vars());
    toml::from_str(&substituted).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Replace `$NAME` occurrences with the given variables.
///
/// Longer names are substituted first so `$PORT` does not clobber `$PORT_ALT`.
pub fn substitute_env(input: &str, vars: impl IntoIterator<Item = (String, String)>) -> String {
    let mut vars: Vec<(String, String)> = vars.into_iter().collect();
    vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    let mut out = input.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("${k}"), &v);
    }
    out
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::UrlParse {
        url: raw.to_string(),
        message: e.to_string(),
    })
}

// Url::join drops the last path segment unless the base ends with '/'.
fn normalize_base(raw: &str) -> String {
    if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}

fn env_parse<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => {
            let parsed = value.trim().parse::<T>();
            match parsed {
                Ok(v) => Ok(Some(v)),
                Err(e) => Err(ConfigError::Invalid {
                    var,
                    message: e.to_string(),
                    value,
                }),
            }
        }
        Err(_) => Ok(None),
    }
}
