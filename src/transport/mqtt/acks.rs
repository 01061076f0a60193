//! Correlation of publish and subscribe requests with broker acknowledgments
//!
//! rumqttc assigns packet ids inside its event loop, so a caller only learns the
//! id of its request when the matching `Outgoing` event comes back out of `poll`.
//! Requests enter the request channel in the same order they are queued here,
//! which lets the driver pair each `Outgoing` event with the oldest queued entry.

use crate::config::QosLevel;
use crate::transport::TransportError;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::debug;

pub type AckResult = Result<(), TransportError>;

struct PendingPublish {
    qos: QosLevel,
    done: oneshot::Sender<AckResult>,
}

/// Publish and subscribe requests awaiting packet ids or acknowledgments
#[derive(Default)]
pub struct AckTracker {
    queued: VecDeque<PendingPublish>,
    in_flight: HashMap<u16, PendingPublish>,
    queued_subscriptions: VecDeque<String>,
    subscriptions_in_flight: HashMap<u16, String>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publish about to be handed to the client
    pub fn enqueue_publish(&mut self, qos: QosLevel) -> oneshot::Receiver<AckResult> {
        let (done, rx) = oneshot::channel();
        self.queued.push_back(PendingPublish { qos, done });
        rx
    }

    /// Undo the most recent `enqueue_publish` when the client refused the request
    pub fn discard_last_publish(&mut self) {
        self.queued.pop_back();
    }

    /// A publish left the client with `pkid`
    ///
    /// QoS 0 publishes complete here. A packet id that is already in flight is a
    /// retransmission: rumqttc only reuses an id after its acknowledgment, so the
    /// queue is left untouched even when the original caller stopped waiting.
    pub fn on_outgoing_publish(&mut self, pkid: u16) {
        if pkid != 0 {
            if let Some(pending) = self.in_flight.get(&pkid) {
                if pending.done.is_closed() {
                    debug!(pkid, "Retransmitted publish nobody waits for");
                } else {
                    debug!(pkid, "Retransmitted publish");
                }
                return;
            }
        }

        let Some(pending) = self.queued.pop_front() else {
            debug!(pkid, "Outgoing publish with no queued request");
            return;
        };

        match pending.qos {
            QosLevel::AtMostOnce => {
                let _ = pending.done.send(Ok(()));
            }
            QosLevel::AtLeastOnce | QosLevel::ExactlyOnce => {
                self.in_flight.insert(pkid, pending);
            }
        }
    }

    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) arrived for `pkid`
    pub fn on_publish_acknowledged(&mut self, pkid: u16) {
        match self.in_flight.remove(&pkid) {
            Some(pending) => {
                if pending.done.send(Ok(())).is_err() {
                    debug!(pkid, "Acknowledgment for an abandoned publish");
                }
            }
            None => debug!(pkid, "Acknowledgment for unknown packet id"),
        }
    }

    /// In-flight publishes whose caller gave up, still awaiting the broker
    pub fn abandoned(&self) -> usize {
        self.in_flight
            .values()
            .filter(|pending| pending.done.is_closed())
            .count()
    }

    /// Register a subscribe about to be handed to the client
    pub fn enqueue_subscription(&mut self, topic: &str) {
        self.queued_subscriptions.push_back(topic.to_string());
    }

    pub fn discard_last_subscription(&mut self) {
        self.queued_subscriptions.pop_back();
    }

    pub fn on_outgoing_subscribe(&mut self, pkid: u16) {
        if self.subscriptions_in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(topic) = self.queued_subscriptions.pop_front() {
            self.subscriptions_in_flight.insert(pkid, topic);
        }
    }

    /// SUBACK arrived; returns the topic filter the subscribe was for
    pub fn on_subscription_acknowledged(&mut self, pkid: u16) -> Option<String> {
        self.subscriptions_in_flight.remove(&pkid)
    }

    /// Fail every outstanding publish, used when the session closes
    pub fn fail_all(&mut self, error: TransportError) {
        for pending in self.queued.drain(..).chain(self.in_flight.drain().map(|(_, p)| p)) {
            let _ = pending.done.send(Err(error.clone()));
        }
        self.queued_subscriptions.clear();
        self.subscriptions_in_flight.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }
}
