//! Gateway configuration system
//!
//! Configuration is loaded from a TOML file with two sections: `[gateway]` for the
//! surrounding process and `[mqtt]` for the broker session. Every field has a default,
//! so an empty file (or no file at all) yields a working plaintext configuration that
//! talks to a broker on `localhost:1883`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Broker URL schemes accepted by the transport
pub const PLAINTEXT_SCHEMES: &[&str] = &["tcp", "mqtt"];
pub const TLS_SCHEMES: &[&str] = &["ssl", "tls", "mqtts"];

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub mqtt: SessionConfig,
}

/// Process-level settings that sit around the broker session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySection {
    /// Prefix for the well-known `status` and `commands` topics
    pub topic_prefix: String,
    /// Port for the HTTP health server
    pub health_port: u16,
    /// Version reported in status documents (defaults to the crate version)
    pub version: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            topic_prefix: "edge/gateway".to_string(),
            health_port: 8080,
            version: None,
        }
    }
}

impl GatewaySection {
    /// Version string published in status and health documents
    pub fn reported_version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }
}

/// Delivery guarantee for publish and subscribe requests
///
/// Only the three levels defined by the protocol can be represented; a raw
/// value outside `0..=2` is rejected when the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = ConfigError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(ConfigError::InvalidConfig(format!(
                "QoS must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(qos: QosLevel) -> Self {
        match qos {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Durable broker session parameters
///
/// Read-only once the gateway starts. Durations are stored as whole seconds
/// (milliseconds for the disconnect grace period) so they can never be negative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Broker URL, e.g. `tcp://localhost:1883` or `ssl://broker:8883`
    pub broker_url: String,
    /// Client identity presented to the broker
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable consulted for the password when `password` is unset
    pub password_env: Option<String>,
    pub clean_session: bool,
    pub qos: QosLevel,
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub ping_timeout_secs: u64,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_secs: u64,
    /// Attempts per reconnect cycle; the cycle window is `delay * attempts`
    pub max_reconnect_attempts: u32,
    pub publish_timeout_secs: u64,
    pub disconnect_grace_ms: u64,
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Topic filters subscribed (in order) on every new session
    pub subscriptions: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broker_url: "tcp://localhost:1883".to_string(),
            client_id: "edge-gateway".to_string(),
            username: None,
            password: None,
            password_env: None,
            clean_session: true,
            qos: QosLevel::AtLeastOnce,
            connect_timeout_secs: 30,
            keep_alive_secs: 60,
            ping_timeout_secs: 10,
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 10,
            publish_timeout_secs: 10,
            disconnect_grace_ms: 250,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            subscriptions: vec!["edge/+/data".to_string()],
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Total time one reconnect cycle may spend retrying
    pub fn reconnect_window(&self) -> Duration {
        self.reconnect_delay()
            .saturating_mul(self.max_reconnect_attempts)
    }

    /// Credentials are only sent when a username is configured
    pub fn credentials(&self) -> Option<(String, String)> {
        self.username.as_ref().map(|username| {
            (
                username.clone(),
                self.password.clone().unwrap_or_default(),
            )
        })
    }

    /// Check the session parameters without touching the filesystem or network
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.broker_url)
            .map_err(|e| ConfigError::InvalidBrokerUrl(format!("{}: {e}", self.broker_url)))?;

        let scheme = url.scheme();
        if !PLAINTEXT_SCHEMES.contains(&scheme) && !TLS_SCHEMES.contains(&scheme) {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{}: unsupported scheme '{scheme}'",
                self.broker_url
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{}: missing host",
                self.broker_url
            )));
        }

        if self.client_id.trim().is_empty() || self.client_id.starts_with(char::is_whitespace) {
            return Err(ConfigError::InvalidConfig(format!(
                "client_id must be non-empty without leading whitespace: {:?}",
                self.client_id
            )));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be at least 1".to_string(),
            ));
        }

        if let Some(filter) = self.subscriptions.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "subscription topic filter must not be empty: {filter:?}"
            )));
        }

        validate_client_identity(
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        )
    }
}

/// A client certificate and its key must be supplied together
pub fn validate_client_identity(
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<(), ConfigError> {
    match (cert, key) {
        (Some(cert), None) => Err(ConfigError::InvalidConfig(format!(
            "client certificate {} configured without a client key",
            cert.display()
        ))),
        (None, Some(key)) => Err(ConfigError::InvalidConfig(format!(
            "client key {} configured without a client certificate",
            key.display()
        ))),
        _ => Ok(()),
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayConfig {
    /// Load configuration from a TOML file, resolve secrets and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse, resolve and validate configuration held in memory
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: GatewayConfig = toml::from_str(content)?;
        config.resolve_env_vars();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.topic_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "gateway.topic_prefix must not be empty".to_string(),
            ));
        }
        self.mqtt.validate()
    }

    fn resolve_env_vars(&mut self) {
        if self.mqtt.password.is_none() {
            if let Some(name) = &self.mqtt.password_env {
                self.mqtt.password = std::env::var(name).ok();
            }
        }
    }

    /// Copy suitable for printing: secrets are masked
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("***".to_string());
        }
        copy
    }
}
