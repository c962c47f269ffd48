use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_INTERVAL_MS: u64 = 500;

pub const MIN_BACKOFF_MS: u64 = 100;
pub const MAX_BACKOFF_MS: u64 = 300_000;
pub const DEFAULT_BACKOFF_MS: u64 = 5_000;

/// Default endpoint of the iTerm2 websocket automation API.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:1912";

/// Root configuration structure. Deserialized from ~/.config/unbell/config.toml.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub reset: ResetConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Websocket endpoint of the iTerm2 automation API.
    #[serde(default = "default_url")]
    pub url: String,
    /// Auth cookie sent during the handshake. Falls back to $ITERM2_COOKIE
    /// when unset.
    #[serde(default)]
    pub cookie: Option<String>,
    /// Delay between reconnect attempts, in milliseconds. Fixed, with no
    /// growth or jitter. Clamped to [100, 300000].
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            cookie: None,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl ConnectionConfig {
    /// Returns the reconnect delay, clamped to a sane range.
    pub fn effective_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.clamp(MIN_BACKOFF_MS, MAX_BACKOFF_MS))
    }

    /// Cookie from the config file, else from the environment iTerm2 sets
    /// for child processes.
    pub fn effective_cookie(&self) -> Option<String> {
        self.cookie
            .clone()
            .or_else(|| std::env::var("ITERM2_COOKIE").ok())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResetConfig {
    /// Period of the unconditional focused-tab reset, in milliseconds.
    /// Clamped to [100, 60000].
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl ResetConfig {
    /// Returns the actuator period, clamped to a sane range.
    pub fn effective_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS))
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_backoff() -> u64 {
    DEFAULT_BACKOFF_MS
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}
