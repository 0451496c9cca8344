//! Configuration system for Tandem
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/dev.tandem.tandem/config.toml
//! - Linux: ~/.config/tandem/config.toml
//! - Windows: %APPDATA%/tandem/tandem/config/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal server settings
    pub signal: SignalConfig,
}

/// Signal server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Relay unknown message types between peers (WebSocket fallback transfers)
    pub ws_fallback: bool,
    /// Path to a JSON file with the WebRTC configuration handed to clients
    pub rtc_config: Option<PathBuf>,
    /// Keep only the first N groups of IPv6 addresses when grouping peers (1-7)
    pub ipv6_localize: Option<u8>,
    /// Honor cf-connecting-ip / x-forwarded-for headers
    pub trust_proxy_headers: bool,
    /// Heartbeat probe interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Probe intervals without a pong before a peer is evicted
    pub heartbeat_max_missed: u32,
    /// Guarded requests allowed per peer within one window
    pub rate_limit_max: u32,
    /// Rate limit window in seconds
    pub rate_limit_window_secs: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ws_fallback: false,
            rtc_config: None,
            ipv6_localize: None,
            trust_proxy_headers: true,
            heartbeat_interval_ms: 1000,
            heartbeat_max_missed: 5,
            rate_limit_max: 10,
            rate_limit_window_secs: 10,
        }
    }
}

impl SignalConfig {
    /// Heartbeat probe interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Rate limit window
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(groups) = self.ipv6_localize {
            if !(1..=7).contains(&groups) {
                return Err(ConfigError::invalid(
                    "ipv6_localize",
                    format!("must be between 1 and 7, got {}", groups),
                ));
            }
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid("heartbeat_interval_ms", "must be positive"));
        }
        if self.heartbeat_max_missed == 0 {
            return Err(ConfigError::invalid("heartbeat_max_missed", "must be positive"));
        }
        if self.rate_limit_max == 0 {
            return Err(ConfigError::invalid("rate_limit_max", "must be positive"));
        }
        Ok(())
    }

    /// Load the WebRTC configuration sent to clients
    ///
    /// Falls back to a single public STUN server when no file is configured.
    pub fn load_rtc_config(&self) -> Result<Value, ConfigError> {
        let Some(path) = &self.rtc_config else {
            return Ok(default_rtc_config());
        };

        let content = std::fs::read_to_string(path)?;
        let value = serde_json::from_str(&content).map_err(|source| ConfigError::RtcConfig {
            path: path.display().to_string(),
            source,
        })?;

        info!("Loaded RTC config from {:?}", path);
        Ok(value)
    }
}

/// WebRTC configuration used when none is provided
pub fn default_rtc_config() -> Value {
    json!({
        "sdpSemantics": "unified-plan",
        "iceServers": [{ "urls": "stun:stun.l.google.com:19302" }]
    })
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "tandem", "tandem")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.signal.validate()
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
