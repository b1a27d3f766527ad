//! # Bridge Configuration
//!
//! TOML configuration for the HTTP surface, the per-printer WebSocket
//! sessions, the streaming helper, and the list of printers to supervise.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8099"
//! api_token = "secret"
//!
//! [session]
//! retry_min_backoff_secs = 1.0
//! retry_max_backoff_secs = 30.0
//!
//! [stream_helper]
//! url = "http://localhost:11984"
//! recheck_secs = 30.0
//!
//! [[printers]]
//! id = "k1c-garage"
//! host = "192.168.1.50"
//! model_hint = "K1C"
//! camera_mode = "auto"
//! # token = "..."   # sent as a bearer token on the WebSocket upgrade
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::camera::CameraMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub stream_helper: StreamHelperConfig,
    #[serde(default)]
    pub printers: Vec<PrinterConfig>,
}

/// HTTP surface settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bearer token required on every request when set.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_token: None,
        }
    }
}

/// Timing knobs shared by every printer session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_retry_min_backoff")]
    pub retry_min_backoff_secs: f64,
    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_secs: f64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: f64,
    #[serde(default = "default_poll_on_silence")]
    pub poll_on_silence_secs: f64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_min_backoff_secs: default_retry_min_backoff(),
            retry_max_backoff_secs: default_retry_max_backoff(),
            stale_after_secs: default_stale_after(),
            heartbeat_secs: default_heartbeat(),
            poll_on_silence_secs: default_poll_on_silence(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl SessionConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_min_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_max_backoff_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_secs)
    }

    pub fn poll_on_silence(&self) -> Duration {
        Duration::from_secs_f64(self.poll_on_silence_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout_secs)
    }
}

/// Location of the go2rtc-compatible streaming helper.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamHelperConfig {
    #[serde(default = "default_helper_url")]
    pub url: String,
    /// Re-check interval while a camera depends on the helper.
    #[serde(default = "default_helper_recheck")]
    pub recheck_secs: f64,
}

impl Default for StreamHelperConfig {
    fn default() -> Self {
        Self {
            url: default_helper_url(),
            recheck_secs: default_helper_recheck(),
        }
    }
}

impl StreamHelperConfig {
    pub fn recheck(&self) -> Duration {
        Duration::from_secs_f64(self.recheck_secs)
    }
}

/// One supervised printer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    pub id: String,
    pub host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
    #[serde(default)]
    pub model_hint: Option<String>,
    #[serde(default)]
    pub camera_mode: CameraMode,
    /// External power switch id; when set the printer starts out powered
    /// until the switch reports otherwise.
    #[serde(default)]
    pub power_switch: Option<String>,
    /// Bearer token for the printer's WebSocket, if its firmware wants one.
    #[serde(default)]
    pub token: Option<String>,
}

impl PrinterConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: default_ws_port(),
            model_hint: None,
            camera_mode: CameraMode::Auto,
            power_switch: None,
            token: None,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Reject configurations no coordinator could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        let seconds = [
            ("retry_min_backoff_secs", s.retry_min_backoff_secs),
            ("retry_max_backoff_secs", s.retry_max_backoff_secs),
            ("heartbeat_secs", s.heartbeat_secs),
            ("poll_on_silence_secs", s.poll_on_silence_secs),
            ("command_timeout_secs", s.command_timeout_secs),
            ("stream_helper.recheck_secs", self.stream_helper.recheck_secs),
        ];
        if let Some((name, value)) = seconds.iter().find(|(_, v)| !v.is_finite() || *v > MAX_SECS) {
            return Err(ConfigError::Invalid(format!("{name} must be a finite number of seconds, got {value}")));
        }
        if s.retry_min_backoff_secs <= 0.0 {
            return Err(ConfigError::Invalid("retry_min_backoff_secs must be > 0".to_string()));
        }
        if s.retry_min_backoff_secs > s.retry_max_backoff_secs {
            return Err(ConfigError::Invalid(format!(
                "retry_min_backoff_secs ({}) exceeds retry_max_backoff_secs ({})",
                s.retry_min_backoff_secs, s.retry_max_backoff_secs
            )));
        }
        if s.heartbeat_secs <= 0.0
            || s.poll_on_silence_secs <= 0.0
            || s.command_timeout_secs <= 0.0
            || self.stream_helper.recheck_secs <= 0.0
        {
            return Err(ConfigError::Invalid("session intervals must be > 0".to_string()));
        }
        if s.stale_after_secs == 0 || s.stale_after_secs as f64 > MAX_SECS {
            return Err(ConfigError::Invalid("stale_after_secs must be > 0 and at most a year".to_string()));
        }
        let mut seen = HashSet::new();
        for printer in &self.printers {
            if printer.id.trim().is_empty() {
                return Err(ConfigError::Invalid("printer id must not be empty".to_string()));
            }
            if printer.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("printer '{}' has an empty host", printer.id)));
            }
            if !seen.insert(printer.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate printer id '{}'", printer.id)));
            }
        }
        Ok(())
    }
}

/// One year; anything longer is a typo.
const MAX_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn default_listen() -> String { "0.0.0.0:8099".to_string() }
fn default_retry_min_backoff() -> f64 { 1.0 }
fn default_retry_max_backoff() -> f64 { 30.0 }
fn default_stale_after() -> u64 { 30 }
fn default_heartbeat() -> f64 { 10.0 }
fn default_poll_on_silence() -> f64 { 10.0 }
fn default_command_timeout() -> f64 { 10.0 }
fn default_helper_url() -> String { "http://localhost:11984".to_string() }
fn default_helper_recheck() -> f64 { 30.0 }
fn default_ws_port() -> u16 { 9999 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
