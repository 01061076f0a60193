//! Pure reconnection decision logic for the MQTT transport
//!
//! The driver asks [`HealthMonitor`] what to do after every failed attempt, and
//! tracks ping round-trips to detect a silent broker before rumqttc's own
//! keep-alive check would.

use super::connection::ReconnectPolicy;
use std::time::Duration;
use tokio::time::Instant;

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide the next step after `attempts_in_cycle` failed attempts
    pub fn should_attempt_reconnection(
        attempts_in_cycle: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if policy.max_attempts > 0 && attempts_in_cycle >= policy.max_attempts {
            return ReconnectionDecision::CycleExhausted {
                attempts: attempts_in_cycle,
                window: policy.cycle_window().unwrap_or_default(),
            };
        }

        let attempt = attempts_in_cycle + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.retry_delay(attempt),
        }
    }

    /// Deadline for the PINGRESP that answers a PINGREQ sent now
    ///
    /// A zero ping timeout disables the check.
    pub fn ping_deadline(sent_at: Instant, ping_timeout: Duration) -> Option<Instant> {
        if ping_timeout.is_zero() {
            None
        } else {
            Some(sent_at + ping_timeout)
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then try again
    Proceed { attempt: u32, delay: Duration },
    /// Shutdown was requested while reconnecting
    AbortShutdownRequested,
    /// The cycle window is used up; the caller starts a new cycle
    CycleExhausted { attempts: u32, window: Duration },
}
