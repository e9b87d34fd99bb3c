//! Daemon settings

use crate::core::access::client::{ClientSettings, OverflowPolicy};
use crate::core::access::codec::MAX_PACKET_PAYLOAD;
use crate::core::hdlc::codec::FRAME_OVERHEAD;
use crate::core::hdlc::frame::DEFAULT_ADDRESS;
use crate::core::hdlc::protocol::{LinkProfile, MAX_WINDOW};
use crate::core::serial::baud::BaudSelection;
use crate::core::serial::handler::LinkSettings;
use crate::core::serial::recovery::RecoveryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Config file {}: {source}", path.display())]
    Io {
        /// File
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Config file {}: {source}", path.display())]
    Parse {
        /// File
        path: PathBuf,
        /// Cause
        source: toml::de::Error,
    },

    /// Settings could not be written as TOML
    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// No per-user configuration directory on this system
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP address clients connect to
    pub listen: String,
    /// Directory for device lock files
    pub lock_dir: PathBuf,
    /// Served devices
    pub devices: Vec<DeviceConfig>,
    /// Link protocol parameters
    pub link: LinkConfig,
    /// Reopen / reconnect pacing
    pub recovery: RecoveryConfig,
    /// Client session options
    pub client: ClientConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5001".to_string(),
            lock_dir: super::default_lock_dir(),
            devices: Vec::new(),
            link: LinkConfig::default(),
            recovery: RecoveryConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load config from the default location, or defaults if there is none
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, content).map_err(io_err)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no serial device configured".into()));
        }
        for device in &self.devices {
            if device.path.trim().is_empty() {
                return Err(ConfigError::Invalid("empty device path".into()));
            }
        }
        let window = self.link.window;
        if window == 0 || window > MAX_WINDOW {
            return Err(ConfigError::Invalid(format!(
                "link.window must be 1..={MAX_WINDOW}, got {window}"
            )));
        }
        if self.link.n2 == 0 {
            return Err(ConfigError::Invalid("link.n2 must be at least 1".into()));
        }
        if self.link.t1_ms == 0 {
            return Err(ConfigError::Invalid("link.t1_ms must be positive".into()));
        }
        let max_payload = self.link.max_payload;
        if max_payload == 0 || max_payload + FRAME_OVERHEAD > MAX_PACKET_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "link.max_payload must be 1..={}, got {max_payload}",
                MAX_PACKET_PAYLOAD - FRAME_OVERHEAD
            )));
        }
        if self.link.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("link.idle_timeout_ms must be positive".into()));
        }
        if self.client.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("client.outbound_buffer must be positive".into()));
        }
        let multiplier = self.recovery.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "recovery.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Link settings for every configured device
    pub fn link_settings(&self) -> Vec<LinkSettings> {
        let recovery = self.recovery.policy();
        self.devices
            .iter()
            .map(|device| {
                let profile = self
                    .link
                    .profile()
                    .address(device.with_address.then_some(device.address));
                LinkSettings {
                    device: device.path.clone(),
                    baud: device.baud,
                    high_water: self.link.high_water.unwrap_or(usize::from(profile.window)),
                    profile,
                    recovery: recovery.clone(),
                    event_buffer: self.client.outbound_buffer,
                    stats_interval: (self.logging.stats_interval_secs > 0)
                        .then(|| Duration::from_secs(self.logging.stats_interval_secs)),
                }
            })
            .collect()
    }

    /// Client session settings
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            header_timeout: Duration::from_millis(self.client.header_timeout_ms),
            overflow_policy: self.client.overflow_policy,
        }
    }
}

/// One served device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device path
    pub path: String,
    /// Baud rate symbol or `auto`
    pub baud: BaudSelection,
    /// Frame address octet
    pub address: u8,
    /// Send and expect the address octet at all
    pub with_address: bool,
}

impl DeviceConfig {
    /// Device with default line settings
    pub fn new(path: impl Into<String>, baud: BaudSelection) -> Self {
        Self {
            path: path.into(),
            baud,
            ..Self::default()
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud: BaudSelection::default(),
            address: DEFAULT_ADDRESS,
            with_address: true,
        }
    }
}

/// Link protocol parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Retransmission timer T1 in milliseconds
    pub t1_ms: u64,
    /// Maximum transmission attempts N2
    pub n2: u32,
    /// Send window W
    pub window: u8,
    /// Silence before a keepalive poll, in milliseconds
    pub idle_timeout_ms: u64,
    /// Largest payload accepted
    pub max_payload: usize,
    /// Queue length at which submissions are refused, defaults to the window
    pub high_water: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let profile = LinkProfile::default();
        Self {
            t1_ms: profile.t1.as_millis() as u64,
            n2: profile.n2,
            window: profile.window,
            idle_timeout_ms: profile.idle_timeout.as_millis() as u64,
            max_payload: profile.max_payload,
            high_water: None,
        }
    }
}

impl LinkConfig {
    /// Link profile with these parameters
    pub fn profile(&self) -> LinkProfile {
        LinkProfile::default()
            .t1(Duration::from_millis(self.t1_ms))
            .n2(self.n2)
            .window(self.window)
            .idle_timeout(Duration::from_millis(self.idle_timeout_ms))
            .max_payload(self.max_payload)
    }
}

/// Reopen / reconnect pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Try at all
    pub enabled: bool,
    /// Consecutive attempts, 0 for unlimited
    pub max_attempts: u32,
    /// First delay in milliseconds
    pub initial_delay_ms: u64,
    /// Delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Growth per attempt
    pub backoff_multiplier: f32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let policy = RecoveryPolicy::default();
        Self {
            enabled: policy.enabled,
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
        }
    }
}

impl RecoveryConfig {
    /// Policy with these parameters
    pub fn policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            enabled: self.enabled,
        }
    }
}

/// Client session options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Link events a client may fall behind before it overflows
    pub outbound_buffer: usize,
    /// Reaction to a lagging client
    pub overflow_policy: OverflowPolicy,
    /// Time allowed for the session header, in milliseconds
    pub header_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
            overflow_policy: OverflowPolicy::default(),
            header_timeout_ms: 5000,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
    /// Also write a daily rolling log file here
    pub directory: Option<PathBuf>,
    /// Period of the link statistics log line, 0 to disable
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
            stats_interval_secs: 300,
        }
    }
}
