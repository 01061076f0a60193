//! Transport layer for broker communication
//!
//! This module defines the publish/subscribe session boundary the connection manager
//! drives, plus the rumqttc-backed implementation used in production.
//!
//! A transport opens a [`Session`] and reports lifecycle changes and inbound messages
//! as [`TransportEvent`]s on a channel. Nothing above this layer sees rumqttc types.

use crate::config::{QosLevel, SessionConfig};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;
pub mod tls;

pub use tls::TlsContext;

/// Events delivered asynchronously by the transport's background driver
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new session was established after a connection loss
    Connected,
    /// The broker connection dropped, or a reconnect attempt failed; the
    /// transport keeps reconnecting
    ConnectionLost(String),
    /// A reconnect attempt (1-based within its cycle) is starting
    Reconnecting { attempt: u32 },
    /// Inbound publish on a subscribed topic
    Message { topic: String, payload: Bytes },
}

/// Errors reported across the transport boundary
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscribe rejected: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("operation timed out")]
    Timeout,
    #[error("session closed")]
    Closed,
}

/// Factory for broker sessions
///
/// `open` returns once the broker has acknowledged the connection. After that,
/// every drop is signalled with [`TransportEvent::ConnectionLost`], every reconnect
/// attempt with [`TransportEvent::Reconnecting`] and every new session with
/// [`TransportEvent::Connected`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    async fn open(
        &self,
        config: &SessionConfig,
        tls: Option<&TlsContext>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self::Session, TransportError>;
}

/// An open broker session
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Issue a subscribe request for one topic filter
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError>;

    /// Publish and wait for the acknowledgment matching `qos`
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Close the session, allowing up to `grace` for in-flight work to flush
    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError>;
}

/// Type alias for the production transport
pub type DefaultTransport = mqtt::MqttTransport;
