//! rumqttc implementation of the transport boundary
//!
//! The module separates pure functions from I/O operations for testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure option building and the reconnect policy
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`health_monitor`] - Pure reconnection and ping deadline decisions
//! - [`acks`] - Correlation of requests with broker acknowledgments
//! - [`client`] - Impure I/O: the session and its event loop driver
//!
//! # Usage
//!
//! ```rust,no_run
//! use edge_gateway::config::{QosLevel, SessionConfig};
//! use edge_gateway::transport::mqtt::MqttTransport;
//! use edge_gateway::transport::{Session, Transport};
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::default();
//! let (events, _rx) = tokio::sync::mpsc::channel(64);
//!
//! let session = MqttTransport::new().open(&config, None, events).await?;
//! session.subscribe("edge/+/data", QosLevel::AtLeastOnce).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod acks;
pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttSession, MqttTransport};
pub use connection::{ReconnectPolicy, TopicBuilder};
pub use health_monitor::{HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
