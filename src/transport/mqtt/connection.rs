//! Pure connection configuration for the MQTT transport
//!
//! This module contains pure functions that turn a [`SessionConfig`] into rumqttc
//! options, plus the fixed-delay reconnect policy.

use crate::config::{SessionConfig, TLS_SCHEMES};
use crate::transport::{TlsContext, TransportError};
use rumqttc::{MqttOptions, NetworkOptions, Transport as RumqttcTransport};
use std::time::Duration;
use url::Url;

/// Default ports when the broker URL omits one
pub const DEFAULT_PLAINTEXT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Capacity of the rumqttc request channel
pub const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Floor applied to the retry delay so a zero delay cannot spin
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Fixed-delay reconnect policy
///
/// Each cycle retries every `delay` up to `max_attempts` times, which caps the
/// cycle at `delay * max_attempts`. When a cycle is exhausted a new one starts;
/// the number of cycles is unbounded. `max_attempts == 0` means a single cycle
/// that never ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_session(&SessionConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            delay: config.reconnect_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before the given attempt (attempts are 1-based)
    pub fn retry_delay(&self, _attempt: u32) -> Duration {
        self.delay.max(MIN_RETRY_DELAY)
    }

    /// Upper bound on time spent in one reconnect cycle, None when uncapped
    pub fn cycle_window(&self) -> Option<Duration> {
        if self.max_attempts == 0 {
            None
        } else {
            Some(self.delay.saturating_mul(self.max_attempts))
        }
    }
}

/// Split a broker URL into host, port and whether it asks for TLS
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), TransportError> {
    let url = Url::parse(broker_url)
        .map_err(|e| TransportError::Connect(format!("invalid broker URL {broker_url}: {e}")))?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::Connect(format!("broker URL {broker_url} has no host")))?;

    let tls = TLS_SCHEMES.contains(&url.scheme());
    let port = url.port().unwrap_or(if tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PLAINTEXT_PORT
    });

    Ok((host.to_string(), port, tls))
}

/// Pure function to build rumqttc options from session configuration
///
/// TLS is enabled when a [`TlsContext`] is supplied, or with the platform roots
/// when the URL scheme requests TLS without a CA bundle.
pub fn configure_mqtt_options(
    config: &SessionConfig,
    tls: Option<&TlsContext>,
) -> Result<MqttOptions, TransportError> {
    let (host, port, tls_scheme) = parse_broker_url(&config.broker_url)?;

    if config.client_id.is_empty() || config.client_id.starts_with(' ') {
        return Err(TransportError::Connect(format!(
            "invalid client id {:?}",
            config.client_id
        )));
    }

    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);
    mqtt_options.set_clean_session(config.clean_session);

    mqtt_options.set_keep_alive(config.keep_alive());

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(username, password);
    }

    match tls {
        Some(context) => {
            mqtt_options.set_transport(context.to_transport());
        }
        None if tls_scheme => {
            mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
        }
        None => {}
    }

    Ok(mqtt_options)
}

/// Socket options applied to the event loop
///
/// rumqttc bounds each TCP/TLS connect plus CONNACK wait with its own timeout
/// (5s unless set), which must match the configured connect timeout.
pub fn network_options(config: &SessionConfig) -> NetworkOptions {
    let mut options = NetworkOptions::new();
    options.set_connection_timeout(config.connect_timeout_secs);
    options
}

/// Well-known topic construction
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build status topic: `{prefix}/status`
    pub fn build_status_topic(prefix: &str) -> String {
        format!("{}/status", prefix.trim_end_matches('/'))
    }

    /// Build command intake topic: `{prefix}/commands`
    pub fn build_commands_topic(prefix: &str) -> String {
        format!("{}/commands", prefix.trim_end_matches('/'))
    }
}
