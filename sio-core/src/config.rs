//! Client configuration management.
//!
//! Handshake, reconnection, heartbeat, acknowledgement and logging settings.
//! Configuration is persisted as TOML on disk; every field has a default so
//! partial files are accepted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SioError, SioResult};

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Handshake request settings.
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Reconnection policy for the persistent stream.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Heartbeat and inactivity watchdog settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Acknowledgement settings.
    #[serde(default)]
    pub acknowledgement: AckConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Handshake request configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Total request timeout in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub timeout_ms: u64,

    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Custom HTTP headers sent with the handshake.
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    /// Whether to accept invalid (e.g. self-signed) TLS certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Query string appended to the handshake and stream URLs, without `?`.
    #[serde(default)]
    pub query: Option<String>,
}

/// Reconnection policy.
///
/// Delays grow as `base * 2^attempt`, capped at `max_delay_ms`, with
/// +/- `jitter_factor` jitter applied to each delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base delay between reconnection attempts.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay cap for exponential backoff.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Retries after the first failed open (0 = unlimited).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Jitter factor (0.0 to 1.0) applied to each delay.
    #[serde(default = "default_jitter")]
    pub jitter_factor: f64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Send heartbeats at the interval negotiated in the handshake.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Treat a silent stream as dead after the negotiated close timeout.
    #[serde(default = "default_true")]
    pub watchdog: bool,
}

/// Acknowledgement configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckConfig {
    /// Fail pending acknowledgements after this many milliseconds (0 = never).
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for log files. If empty, uses default location.
    #[serde(default)]
    pub directory: String,

    /// Enable JSON structured logging output.
    #[serde(default)]
    pub json_output: bool,
}

// Default value functions for serde

fn default_handshake_timeout() -> u64 {
    20_000
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_jitter() -> f64 {
    0.3
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            custom_headers: HashMap::new(),
            accept_invalid_certs: false,
            query: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter(),
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether another retry is allowed after `retries` failed retries.
    pub fn allows_retry(&self, retries: u32) -> bool {
        self.max_attempts == 0 || retries < self.max_attempts
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watchdog: true,
        }
    }
}

impl AckConfig {
    /// The acknowledgement timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
            json_output: false,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the default config file path.
    ///
    /// Falls back to defaults when no file exists yet.
    pub fn load_default() -> SioResult<Self> {
        Self::load_or_default(&Self::default_config_path()?)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: &Path) -> SioResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> SioResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> SioResult<Self> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> SioResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| SioError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path.
    ///
    /// - Linux: `~/.config/sio-client/config.toml`
    /// - macOS: `~/Library/Application Support/sio-client/config.toml`
    /// - Windows: `%APPDATA%/sio-client/config.toml`
    pub fn default_config_path() -> SioResult<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| SioError::Config("could not determine config directory".into()))?;
        Ok(base.join("sio-client").join("config.toml"))
    }

    /// Get the effective log directory, using the configured path or the default.
    pub fn effective_log_dir(&self) -> SioResult<PathBuf> {
        if self.logging.directory.is_empty() {
            let base = dirs::data_local_dir()
                .ok_or_else(|| SioError::Config("could not determine data directory".into()))?;
            Ok(base.join("sio-client").join("logs"))
        } else {
            Ok(PathBuf::from(&self.logging.directory))
        }
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> SioResult<()> {
        let reconnect = &self.reconnect;
        if !(0.0..=1.0).contains(&reconnect.jitter_factor) {
            return Err(SioError::Config(format!(
                "reconnect.jitter_factor must be within 0..=1, got {}",
                reconnect.jitter_factor
            )));
        }
        if reconnect.base_delay_ms > reconnect.max_delay_ms {
            return Err(SioError::Config(format!(
                "reconnect.base_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                reconnect.base_delay_ms, reconnect.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Sanitize and normalize a server address.
    ///
    /// Ensures the address has a scheme and strips quotes and trailing slashes.
    pub fn sanitize_server_address(address: &str) -> String {
        let trimmed = address.trim().trim_matches('"').trim();
        if trimmed.is_empty() {
            return String::new();
        }

        let with_scheme = if trimmed.starts_with("http://")
            || trimmed.starts_with("https://")
            || trimmed.starts_with("ws://")
            || trimmed.starts_with("wss://")
        {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };

        with_scheme.trim_end_matches('/').to_string()
    }
}
