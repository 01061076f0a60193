//! Mock transport for testing
//!
//! [`MockTransport`] records every subscribe and publish call and lets a test
//! inject [`TransportEvent`]s as if they came from a broker, so the connection
//! manager can be exercised without a network.

use crate::config::{QosLevel, SessionConfig};
use crate::transport::{Session, TlsContext, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// A publish captured by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retain: bool,
}

#[derive(Default)]
struct MockState {
    open_count: usize,
    disconnect_count: usize,
    connect_failure: Option<String>,
    failing_topics: HashSet<String>,
    publish_failure: Option<TransportError>,
    publish_delay: Option<Duration>,
    connect_delay: Option<Duration>,
    subscribe_calls: Vec<(String, QosLevel)>,
    published: Vec<PublishedMessage>,
    last_config: Option<SessionConfig>,
    used_tls: bool,
    events: Option<mpsc::Sender<TransportEvent>>,
    closed: bool,
}

/// Mock transport; clones share the same recorded state
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Make every `open` fail with `reason`
    pub fn fail_connect(&self, reason: &str) {
        self.state().connect_failure = Some(reason.to_string());
    }

    pub fn allow_connect(&self) {
        self.state().connect_failure = None;
    }

    /// Make subscribe calls for `topic` fail
    pub fn fail_subscribe(&self, topic: &str) {
        self.state().failing_topics.insert(topic.to_string());
    }

    pub fn fail_publish(&self, error: TransportError) {
        self.state().publish_failure = Some(error);
    }

    /// Hold every `open` for `delay` before it completes
    pub fn delay_connect(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// Hold every publish for `delay` before acknowledging it
    pub fn delay_publish(&self, delay: Duration) {
        self.state().publish_delay = Some(delay);
    }

    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnect_count
    }

    /// Topics of every subscribe call, in call order
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state()
            .subscribe_calls
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QosLevel)> {
        self.state().subscribe_calls.clone()
    }

    pub fn clear_subscribe_calls(&self) {
        self.state().subscribe_calls.clear();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn publish_count(&self) -> usize {
        self.state().published.len()
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        self.state().last_config.clone()
    }

    pub fn used_tls(&self) -> bool {
        self.state().used_tls
    }

    /// Inject an event as if the transport driver produced it
    ///
    /// Returns false when no session is open.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.state().events.clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn simulate_connection_lost(&self, reason: &str) -> bool {
        self.emit(TransportEvent::ConnectionLost(reason.to_string()))
            .await
    }

    pub async fn simulate_reconnect_attempt(&self, attempt: u32) -> bool {
        self.emit(TransportEvent::Reconnecting { attempt }).await
    }

    pub async fn simulate_reconnect(&self) -> bool {
        self.emit(TransportEvent::Connected).await
    }

    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        })
        .await
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    type Session = MockSession;

    async fn open(
        &self,
        config: &SessionConfig,
        tls: Option<&TlsContext>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<MockSession, TransportError> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.open_count += 1;
        state.last_config = Some(config.clone());
        state.used_tls = tls.is_some();

        if let Some(reason) = &state.connect_failure {
            return Err(TransportError::Connect(reason.clone()));
        }

        state.events = Some(events);
        state.closed = false;
        Ok(MockSession {
            state: self.state.clone(),
        })
    }
}

/// Session handed out by [`MockTransport`]
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.subscribe_calls.push((topic.to_string(), qos));

        if state.failing_topics.contains(topic) {
            return Err(TransportError::Subscribe(format!("{topic}: not authorized")));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), TransportError> {
        let delay = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(TransportError::Closed);
            }
            if let Some(error) = &state.publish_failure {
                return Err(error.clone());
            }
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            state.publish_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.disconnect_count += 1;
        // Dropping the sender ends the manager's supervisor
        state.events = None;
        Ok(())
    }
}
