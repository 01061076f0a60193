//! Edge Gateway
//!
//! An edge-side MQTT message gateway. It keeps a durable session with a broker,
//! routes inbound messages to per-topic handlers, publishes its own status and
//! recovers from connection loss on its own.
//!
//! # Overview
//!
//! - [`config`] - TOML configuration and the broker session parameters
//! - [`transport`] - Session boundary, TLS material and the rumqttc implementation
//! - [`gateway`] - Connection manager, handler registry and dispatch
//! - [`observability`] - Structured logging, metrics and the health endpoint
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use edge_gateway::{Gateway, GatewayConfig};
//!
//! # tokio_test::block_on(async {
//! let mut gateway = Gateway::build(GatewayConfig::default())?;
//! gateway
//!     .manager()
//!     .register_handler("edge/node-1/data", |topic, payload| {
//!         println!("{topic}: {} bytes", payload.len());
//!     });
//!
//! gateway.start().await?;
//! gateway.manager().publish("edge/node-1/ack", "ok").await?;
//! gateway.shutdown().await?;
//! # Ok::<(), edge_gateway::GatewayError>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{GatewayConfig, QosLevel, SessionConfig};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{
    ConnectionManager, ConnectionState, DispatchOutcome, Gateway, HandlerRegistry, Payload,
};
pub use transport::{Session, TlsContext, Transport, TransportError, TransportEvent};
