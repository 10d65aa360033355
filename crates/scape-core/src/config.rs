//! Configuration system for the Scape daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SCAPE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/scape/config.toml
//!   3. ~/.config/scape/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScapeConfig {
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub store: StoreConfig,
    pub roboscape: RoboScapeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address both family sockets bind to.
    pub bind_addr: String,
    /// UDP port for JSON-family devices. 0 = family disabled.
    pub iotscape_port: u16,
    /// UDP port for binary-family robots. 0 = family disabled.
    pub roboscape_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait per attempt before a JSON request is retried or abandoned.
    pub response_timeout_ms: u64,
    /// Wait for a robot's range/ticks answer.
    pub robot_response_timeout_ms: u64,
    /// Housekeeping tick: rate windows and heartbeat counters.
    pub tick_interval_ms: u64,
    /// Ticks without traffic before a device is forgotten.
    pub forget_ticks: u32,
    /// Interval between heartbeat probes of JSON-family devices. 0 = never.
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Where accepted service definitions are written.
    pub path: PathBuf,
    /// If false, definitions are kept in memory only.
    pub persist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoboScapeConfig {
    /// How robot telemetry reaches listening clients.
    pub mode: RoboScapeMode,
}

/// Delivery mode for robot telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoboScapeMode {
    /// Typed messages only.
    Native,
    /// Encrypted text envelopes only.
    Security,
    /// Typed message followed by the encrypted envelope.
    Both,
}

impl RoboScapeMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "native" => Some(RoboScapeMode::Native),
            "security" => Some(RoboScapeMode::Security),
            "both" => Some(RoboScapeMode::Both),
            _ => None,
        }
    }

    pub fn native(self) -> bool {
        matches!(self, RoboScapeMode::Native | RoboScapeMode::Both)
    }

    pub fn security(self) -> bool {
        matches!(self, RoboScapeMode::Security | RoboScapeMode::Both)
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            iotscape_port: 0,
            roboscape_port: 0,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3000,
            robot_response_timeout_ms: 200,
            tick_interval_ms: 1000,
            forget_ticks: 120,
            heartbeat_interval_secs: 120,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("services.json"),
            persist: true,
        }
    }
}

impl Default for RoboScapeConfig {
    fn default() -> Self {
        Self {
            mode: RoboScapeMode::Both,
        }
    }
}

impl TimingConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn robot_response_timeout(&self) -> Duration {
        Duration::from_millis(self.robot_response_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// `None` disables heartbeat probing.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("scape")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("scape")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ScapeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse `path`, or defaults when it does not exist. No env overrides.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(ScapeConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SCAPE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    /// Write default config to `path` unless something is already there.
    pub fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        let path = path.to_path_buf();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ScapeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SCAPE_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Some(p) = lookup("IOTSCAPE_PORT").and_then(|v| v.parse().ok()) {
            self.network.iotscape_port = p;
        }
        if let Some(p) = lookup("ROBOSCAPE_PORT").and_then(|v| v.parse().ok()) {
            self.network.roboscape_port = p;
        }
        if let Some(mode) = lookup("ROBOSCAPE_MODE").and_then(|v| RoboScapeMode::parse(&v)) {
            self.roboscape.mode = mode;
        }
        if let Some(v) = lookup("SCAPE_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SCAPE_STORE__PERSIST") {
            self.store.persist = v == "true" || v == "1";
        }
        if let Some(ms) = lookup("SCAPE_TIMING__RESPONSE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.timing.response_timeout_ms = ms;
        }
        if let Some(n) = lookup("SCAPE_TIMING__FORGET_TICKS").and_then(|v| v.parse().ok()) {
            self.timing.forget_ticks = n;
        }
        if let Some(s) = lookup("SCAPE_TIMING__HEARTBEAT_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.timing.heartbeat_interval_secs = s;
        }
    }
}
