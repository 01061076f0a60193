//! Connection manager: owner of the broker session
//!
//! The manager drives the connection state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ReconnectPending <-> Connecting
//!       ^                            ^                                |
//!       |                            +--------------------------------+
//!       +------------------- disconnect() from any state
//! ```
//!
//! `connect()` opens a session through the [`Transport`], subscribes every
//! configured topic filter and only then reports `Connected`. A supervisor task
//! consumes [`TransportEvent`]s: connection loss moves the state to
//! `ReconnectPending`, each reconnect attempt to `Connecting` (and back on
//! failure), a new session triggers a full resubscription, and inbound messages
//! go to the [`Dispatcher`]. The transport does the reconnecting.

use super::dispatcher::Dispatcher;
use super::payload::Payload;
use super::registry::HandlerRegistry;
use super::state::{log_state_transition, ConnectionState};
use crate::config::{QosLevel, SessionConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::mqtt_span;
use crate::observability::metrics::GatewayMetrics;
use crate::transport::{
    DefaultTransport, Session, TlsContext, Transport, TransportError, TransportEvent,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the transport event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound on waiting for the supervisor after the session closed
const SUPERVISOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Ordered, duplicate-free list of topic filters to (re)subscribe
#[derive(Debug, Default)]
struct SubscriptionSet {
    topics: RwLock<Vec<String>>,
}

impl SubscriptionSet {
    fn new(topics: &[String]) -> Self {
        let set = Self::default();
        for topic in topics {
            set.insert(topic);
        }
        set
    }

    /// Returns false when the filter was already present
    fn insert(&self, topic: &str) -> bool {
        let mut topics = self
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if topics.iter().any(|t| t == topic) {
            return false;
        }
        topics.push(topic.to_string());
        true
    }

    fn snapshot(&self) -> Vec<String> {
        self.topics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// State shared between the manager and its supervisor task
struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: SubscriptionSet,
    qos: QosLevel,
    metrics: Arc<GatewayMetrics>,
}

impl Shared {
    fn transition(&self, to: ConnectionState) {
        let from = self.state_tx.send_replace(to);
        log_state_transition(from, to);
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe every configured filter; returns how many succeeded
    ///
    /// A failing filter is logged and skipped, it never stops the others.
    async fn resubscribe<S: Session>(&self, session: &S) -> usize {
        let topics = self.subscriptions.snapshot();
        let mut subscribed = 0;

        for topic in &topics {
            match session.subscribe(topic, self.qos).await {
                Ok(()) => {
                    debug!(topic = %topic, qos = %self.qos, "Subscribed");
                    subscribed += 1;
                }
                Err(source) => {
                    let error = GatewayError::Subscribe {
                        topic: topic.clone(),
                        source,
                    };
                    warn!("{}", error);
                    self.metrics.subscribe_failed();
                }
            }
        }

        info!(subscribed, total = topics.len(), "Subscriptions restored");
        subscribed
    }
}

/// Owner of the broker session and the connection state
pub struct ConnectionManager<T: Transport = DefaultTransport> {
    config: SessionConfig,
    tls: Option<TlsContext>,
    transport: T,
    dispatcher: Arc<Dispatcher>,
    shared: Arc<Shared>,
    session: Option<Arc<T::Session>>,
    supervisor: Option<JoinHandle<()>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        config: SessionConfig,
        tls: Option<TlsContext>,
        transport: T,
        registry: Arc<HandlerRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            state_tx,
            subscriptions: SubscriptionSet::new(&config.subscriptions),
            qos: config.qos,
            metrics: metrics.clone(),
        });

        Self {
            config,
            tls,
            transport,
            dispatcher: Arc::new(Dispatcher::new(registry, metrics)),
            shared,
            session: None,
            supervisor: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver that observes every state transition
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.dispatcher.registry()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Topic filters subscribed on every (re)connect
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.snapshot()
    }

    /// Register a handler for an exact topic; replaces any previous handler
    pub fn register_handler<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.registry().register(topic, handler);
    }

    /// Open the broker session and subscribe the configured topics
    ///
    /// A no-op unless the manager is `Disconnected`.
    pub async fn connect(&mut self) -> GatewayResult<()> {
        let current = self.state();
        if current != ConnectionState::Disconnected {
            info!(state = %current, "connect() ignored, manager is not disconnected");
            return Ok(());
        }

        let span = mqtt_span!(operation = "connect", broker = %self.config.broker_url);
        async {
            self.shared.transition(ConnectionState::Connecting);
            self.shared.metrics.connection_attempt();

            let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let opened = tokio::time::timeout(
                self.config.connect_timeout(),
                self.transport
                    .open(&self.config, self.tls.as_ref(), events_tx),
            )
            .await;

            let session = match opened {
                Ok(Ok(session)) => Arc::new(session),
                Ok(Err(e)) => return Err(self.connect_failed(e)),
                Err(_) => return Err(self.connect_failed(TransportError::Timeout)),
            };

            self.shared.resubscribe(session.as_ref()).await;
            self.shared.transition(ConnectionState::Connected);
            self.shared.metrics.connection_established();

            self.supervisor = Some(tokio::spawn(supervise(
                events_rx,
                session.clone(),
                self.shared.clone(),
                self.dispatcher.clone(),
            )));
            self.session = Some(session);

            info!(client_id = %self.config.client_id, "Connected to MQTT broker");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn connect_failed(&self, error: TransportError) -> GatewayError {
        self.shared.metrics.connection_failed();
        self.shared.transition(ConnectionState::Disconnected);
        error!(broker = %self.config.broker_url, "Connection failed: {}", error);
        GatewayError::connection(format!("{}: {}", self.config.broker_url, error))
    }

    /// Add a topic filter; subscribed immediately when connected
    ///
    /// Filters already in the set are not subscribed again.
    pub async fn subscribe(&self, topic: &str) -> GatewayResult<()> {
        if !self.shared.subscriptions.insert(topic) {
            debug!(topic, "Already subscribed");
            return Ok(());
        }

        match (&self.session, self.state()) {
            (Some(session), ConnectionState::Connected) => session
                .subscribe(topic, self.shared.qos)
                .await
                .map_err(|source| {
                    self.shared.metrics.subscribe_failed();
                    GatewayError::Subscribe {
                        topic: topic.to_string(),
                        source,
                    }
                }),
            _ => Ok(()),
        }
    }

    /// Publish with the configured QoS, not retained
    pub async fn publish(&self, topic: &str, payload: impl Into<Payload>) -> GatewayResult<()> {
        self.publish_with(topic, payload, self.config.qos, false)
            .await
    }

    /// Publish and wait for the acknowledgment matching `qos`
    pub async fn publish_with(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        qos: QosLevel,
        retain: bool,
    ) -> GatewayResult<()> {
        let state = self.state();
        let session = match (&self.session, state) {
            (Some(session), ConnectionState::Connected) => session,
            _ => return Err(GatewayError::NotConnected { state }),
        };

        let bytes = payload.into().into_bytes()?;
        let size = bytes.len();

        let result = match tokio::time::timeout(
            self.config.publish_timeout(),
            session.publish(topic, bytes, qos, retain),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(()) => {
                self.shared.metrics.message_published();
                debug!(topic, bytes = size, %qos, retain, "Published");
                Ok(())
            }
            Err(source) => {
                self.shared.metrics.publish_failed();
                warn!(topic, "Publish failed: {}", source);
                Err(GatewayError::Publish {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Close the session within the configured grace period
    ///
    /// Idempotent: calling it while disconnected does nothing.
    pub async fn disconnect(&mut self) -> GatewayResult<()> {
        let Some(session) = self.session.take() else {
            // A connect() dropped mid-flight leaves Connecting behind
            if self.state() != ConnectionState::Disconnected {
                self.shared.transition(ConnectionState::Disconnected);
            }
            debug!("disconnect() without an open session");
            return Ok(());
        };

        // Events racing with the close are ignored once the state says Disconnected
        self.shared.transition(ConnectionState::Disconnected);

        let grace = self.config.disconnect_grace();
        if let Err(e) = session.disconnect(grace).await {
            warn!("Error while closing session: {}", e);
        }

        if let Some(mut handle) = self.supervisor.take() {
            if tokio::time::timeout(SUPERVISOR_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Supervisor did not stop after disconnect, aborting");
                handle.abort();
            }
        }

        self.shared.metrics.disconnected();
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// Consume transport events until the transport closes its channel
async fn supervise<S: Session>(
    mut events: mpsc::Receiver<TransportEvent>,
    session: Arc<S>,
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                if shared.state() == ConnectionState::Disconnected {
                    continue;
                }
                shared.resubscribe(session.as_ref()).await;
                shared.transition(ConnectionState::Connected);
                shared.metrics.reconnected();
            }
            TransportEvent::ConnectionLost(reason) => {
                let previous = shared.state();
                if previous == ConnectionState::Disconnected {
                    continue;
                }
                shared.transition(ConnectionState::ReconnectPending);
                if previous == ConnectionState::Connected {
                    warn!(reason = %reason, "Connection lost, waiting for reconnect");
                    shared.metrics.connection_lost();
                } else {
                    debug!(reason = %reason, "Reconnect attempt failed");
                }
            }
            TransportEvent::Reconnecting { attempt } => {
                if shared.state() == ConnectionState::Disconnected {
                    continue;
                }
                debug!(attempt, "Reconnect attempt started");
                shared.transition(ConnectionState::Connecting);
            }
            TransportEvent::Message { topic, payload } => {
                dispatcher.on_message(&topic, &payload);
            }
        }
    }
    debug!("Transport event channel closed, supervisor stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockTransport;

    fn manager(transport: MockTransport) -> ConnectionManager<MockTransport> {
        let config = SessionConfig {
            subscriptions: vec![
                "edge/+/data".to_string(),
                "edge/gateway/commands".to_string(),
                "edge/+/data".to_string(),
            ],
            ..SessionConfig::default()
        };
        ConnectionManager::new(
            config,
            None,
            transport,
            Arc::new(HandlerRegistry::new()),
            Arc::new(GatewayMetrics::new()),
        )
    }

    #[test]
    fn test_subscription_set_dedupes_in_order() {
        let set = SubscriptionSet::new(&["a".to_string(), "b".to_string(), "a".to_string()]);
        assert_eq!(set.snapshot(), vec!["a".to_string(), "b".to_string()]);
        assert!(!set.insert("b"));
        assert!(set.insert("c"));
    }

    #[tokio::test]
    async fn test_connect_subscribes_each_filter_once() {
        let transport = MockTransport::new();
        let mut manager = manager(transport.clone());

        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            transport.subscribed_topics(),
            vec!["edge/+/data".to_string(), "edge/gateway/commands".to_string()]
        );
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let transport = MockTransport::new();
        let mut manager = manager(transport.clone());

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.subscribed_topics().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let transport = MockTransport::new();
        transport.fail_connect("connection refused");
        let mut manager = manager(transport.clone());

        let result = manager.connect().await;

        assert!(matches!(result, Err(GatewayError::Connection(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_adds_filter_once() {
        let transport = MockTransport::new();
        let mut manager = manager(transport.clone());
        manager.connect().await.unwrap();

        manager.subscribe("edge/extra").await.unwrap();
        manager.subscribe("edge/extra").await.unwrap();

        assert_eq!(
            transport
                .subscribed_topics()
                .iter()
                .filter(|t| *t == "edge/extra")
                .count(),
            1
        );
        assert!(manager.subscriptions().contains(&"edge/extra".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = MockTransport::new();
        let mut manager = manager(transport.clone());
        manager.connect().await.unwrap();

        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.disconnect_count(), 1);
    }
}
