//! Status document published on `<prefix>/status`

use serde::{Deserialize, Serialize};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub status: String,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
    pub version: String,
}

impl StatusDocument {
    pub fn new(status: &str, version: &str) -> Self {
        Self {
            status: status.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            version: version.to_string(),
        }
    }

    pub fn online(version: &str) -> Self {
        Self::new(STATUS_ONLINE, version)
    }

    pub fn offline(version: &str) -> Self {
        Self::new(STATUS_OFFLINE, version)
    }
}
