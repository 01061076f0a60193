//! Error taxonomy for the edge gateway
//!
//! Configuration and certificate errors are fatal at startup. Connection loss after a
//! successful start never surfaces here; it is recovered by the reconnect loop and only
//! logged. Publish errors are returned to the caller; subscribe errors are per topic and
//! are logged and skipped during resubscription.

use crate::config::ConfigError;
use crate::gateway::ConnectionState;
use crate::transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to load certificate material from {path}: {reason}")]
    CertificateLoad { path: PathBuf, reason: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn certificate_load<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::CertificateLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into())
    }

    /// Errors that must stop the process before it serves traffic
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            GatewayError::Configuration(_)
                | GatewayError::CertificateLoad { .. }
                | GatewayError::Connection(_)
        )
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
