//! Connection state owned by the connection manager

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle of the broker connection
///
/// `Disconnected` is both the initial state and the state after an explicit
/// `disconnect()`. Connection loss moves `Connected` to `ReconnectPending`, never
/// to `Disconnected`; every automatic reconnect attempt passes through
/// `Connecting` and falls back to `ReconnectPending` when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectPending => "reconnect_pending",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log a state transition at a level matching its severity
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    if from == to {
        return;
    }
    match to {
        ConnectionState::Connected => info!(from = %from, to = %to, "Connection state changed"),
        ConnectionState::ReconnectPending => {
            warn!(from = %from, to = %to, "Connection state changed")
        }
        _ => debug!(from = %from, to = %to, "Connection state changed"),
    }
}
