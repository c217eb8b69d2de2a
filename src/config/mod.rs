//! Configuration Module
//!
//! TOML configuration for RelayMQ:
//! - Server settings (bind address)
//! - Connection and queue limits
//! - Delivery retries
//! - Session and keep alive parameters
//! - MQTT feature flags
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;
use crate::session::{OverflowPolicy, SessionLimits};

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    /// Acknowledgement timeouts and retries
    pub delivery: DeliveryConfig,
    pub session: SessionConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
        }
    }
}

/// Connection and per-session limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    /// Maximum packet size in bytes
    pub max_packet_size: usize,
    /// Maximum in-flight messages per client (QoS 1/2)
    pub max_inflight: usize,
    /// Maximum queued messages per client
    pub max_queued_messages: usize,
    /// What happens to a message arriving at a full queue
    pub overflow_policy: OverflowPolicy,
    /// Maximum pending PUBREL for QoS 2
    pub max_awaiting_rel: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let session = SessionLimits::default();
        Self {
            max_connections: 10_000,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            max_inflight: session.max_inflight,
            max_queued_messages: session.max_queued_messages,
            overflow_policy: session.overflow_policy,
            max_awaiting_rel: session.max_awaiting_rel,
        }
    }
}

/// Delivery retry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Time to wait for an acknowledgement before resending, e.g. "30s"
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Resends before a delivery counts as failed
    pub max_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(20),
            max_retries: 3,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed for the CONNECT packet to arrive
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Keep alive in seconds assigned to v5 clients that send 0
    pub default_keep_alive: u16,
    /// Maximum keep alive in seconds
    pub max_keep_alive: u16,
    /// Maximum topic aliases
    pub max_topic_aliases: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            default_keep_alive: 0,
            max_keep_alive: 65535,
            max_topic_aliases: 64,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    pub max_qos: u8,
    /// Whether retained messages are available
    pub retain_available: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `RELAYMQ__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///    - `RELAYMQ__DELIVERY__ACK_TIMEOUT=5s` overrides `delivery.ack_timeout`
    ///
    /// A missing file yields the defaults plus environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("limits.max_connections", 10_000)?
            .set_default("limits.max_packet_size", crate::codec::DEFAULT_MAX_PACKET_SIZE as u64)?
            .set_default("limits.max_inflight", 32)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.overflow_policy", "drop_oldest")?
            .set_default("limits.max_awaiting_rel", 100)?
            .set_default("delivery.ack_timeout", "20s")?
            .set_default("delivery.max_retries", 3)?
            .set_default("session.connect_timeout", "10s")?
            .set_default("session.default_keep_alive", 0)?
            .set_default("session.max_keep_alive", 65535)?
            .set_default("session.max_topic_aliases", 64)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.limits.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "max_inflight must be at least 1".to_string(),
            ));
        }
        if self.limits.max_queued_messages == 0 {
            return Err(ConfigError::Validation(
                "max_queued_messages must be at least 1".to_string(),
            ));
        }
        if self.delivery.ack_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "ack_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Runtime broker settings
    pub fn broker_config(&self) -> BrokerConfig {
        let max_qos = QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce);
        BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            connect_timeout: self.session.connect_timeout,
            default_keep_alive: self.session.default_keep_alive,
            max_keep_alive: self.session.max_keep_alive,
            ack_timeout: self.delivery.ack_timeout,
            max_retries: self.delivery.max_retries,
            retain_available: self.mqtt.retain_available,
            max_topic_alias: self.session.max_topic_aliases,
            session_limits: SessionLimits {
                max_inflight: self.limits.max_inflight,
                max_queued_messages: self.limits.max_queued_messages,
                overflow_policy: self.limits.overflow_policy,
                max_awaiting_rel: self.limits.max_awaiting_rel,
                max_qos,
            },
        }
    }
}
