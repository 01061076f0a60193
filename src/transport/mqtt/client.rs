//! Impure I/O operations for the MQTT transport
//!
//! [`MqttTransport`] opens an rumqttc connection and waits for the broker's CONNACK.
//! A background driver task then owns the event loop: it routes every event,
//! resolves publish acknowledgments, watches ping round-trips and reconnects on
//! a fixed delay when the connection drops.

use super::acks::AckTracker;
use super::connection::{
    configure_mqtt_options, network_options, ReconnectPolicy, REQUEST_CHANNEL_CAPACITY,
};
use super::health_monitor::{HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{QosLevel, SessionConfig};
use crate::transport::{Session, TlsContext, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// rumqttc-backed transport
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }

    /// Poll until the broker acknowledges the connection
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectionError> {
        loop {
            let event = event_loop.poll().await?;
            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(()),
                other => debug!(target: "mqtt_transport", "Event before CONNACK: {:?}", other),
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Session = MqttSession;

    async fn open(
        &self,
        config: &SessionConfig,
        tls: Option<&TlsContext>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<MqttSession, TransportError> {
        let mqtt_options = configure_mqtt_options(config, tls)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        event_loop.set_network_options(network_options(config));

        info!(
            broker = %config.broker_url,
            client_id = %config.client_id,
            tls = tls.is_some(),
            "Connecting to MQTT broker"
        );

        match tokio::time::timeout(
            config.connect_timeout(),
            Self::wait_for_connack(&mut event_loop),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => {
                warn!(
                    timeout = ?config.connect_timeout(),
                    "No CONNACK received before the connect timeout"
                );
                return Err(TransportError::Timeout);
            }
        }

        let tracker = Arc::new(StdMutex::new(AckTracker::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            event_loop,
            events,
            tracker: tracker.clone(),
            closing: closing.clone(),
            shutdown_rx,
            policy: ReconnectPolicy::from_session(config),
            connect_timeout: config.connect_timeout(),
            ping_timeout: config.ping_timeout(),
            ping_deadline: None,
        };
        let handle = tokio::spawn(driver.run());

        Ok(MqttSession {
            client,
            request_lock: Mutex::new(()),
            tracker,
            closing,
            shutdown_tx,
            driver: StdMutex::new(Some(handle)),
        })
    }
}

/// An open rumqttc session
pub struct MqttSession {
    client: AsyncClient,
    // Keeps tracker order identical to request channel order
    request_lock: Mutex<()>,
    tracker: Arc<StdMutex<AckTracker>>,
    closing: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    fn tracker(&self) -> MutexGuard<'_, AckTracker> {
        lock_tracker(&self.tracker)
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closing.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        self.ensure_open()?;

        let _guard = self.request_lock.lock().await;
        self.tracker().enqueue_subscription(topic);
        if let Err(e) = self.client.subscribe(topic, qos.into()).await {
            self.tracker().discard_last_subscription();
            return Err(TransportError::Subscribe(format!("{topic}: {e}")));
        }

        debug!(target: "mqtt_transport", topic, %qos, "Subscribe request sent");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let ack = {
            let _guard = self.request_lock.lock().await;
            let ack = self.tracker().enqueue_publish(qos);
            if let Err(e) = self
                .client
                .publish_bytes(topic, qos.into(), retain, payload)
                .await
            {
                self.tracker().discard_last_publish();
                return Err(TransportError::Publish(e.to_string()));
            }
            ack
        };

        match ack.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!(target: "mqtt_transport", "Session already closing");
            return Ok(());
        }

        if let Err(e) = self.client.disconnect().await {
            debug!(target: "mqtt_transport", "DISCONNECT request not delivered: {}", e);
        }

        if let Some(mut handle) = self.take_driver() {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!(target: "mqtt_transport", "Driver stopped gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Driver task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(?grace, "Driver did not stop within grace period, aborting");
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }

        self.tracker().fail_all(TransportError::Closed);
        info!("MQTT session closed");
        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(handle) = self.take_driver() {
            handle.abort();
        }
    }
}

fn lock_tracker(tracker: &StdMutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether the driver keeps running after handling an event
enum Flow {
    Continue,
    ConnectionLost(String),
    Stop,
}

/// Background task that owns the rumqttc event loop
struct Driver {
    event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    tracker: Arc<StdMutex<AckTracker>>,
    closing: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    ping_timeout: Duration,
    ping_deadline: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        info!(target: "mqtt_transport", "Starting MQTT event loop");

        loop {
            let flow = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                }
                result = self.event_loop.poll() => match result {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        self.process_event_route(route).await
                    }
                    Err(e) => Flow::ConnectionLost(e.to_string()),
                },
                _ = wait_for_deadline(self.ping_deadline) => {
                    warn!(timeout = ?self.ping_timeout, "No PINGRESP from broker");
                    self.event_loop.clean();
                    Flow::ConnectionLost("ping timeout".to_string())
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::ConnectionLost(reason) => {
                    if self.closing.load(Ordering::SeqCst) {
                        debug!(target: "mqtt_transport", "Connection closed during shutdown: {}", reason);
                        break;
                    }
                    if !self.reconnect(reason).await {
                        break;
                    }
                }
            }
        }

        lock_tracker(&self.tracker).fail_all(TransportError::Closed);
        info!(target: "mqtt_transport", "MQTT event loop stopped");
    }

    async fn process_event_route(&mut self, route: EventRoute) -> Flow {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.emit(TransportEvent::Connected).await;
                Flow::Continue
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                debug!(target: "mqtt_transport", topic = %topic, retain, bytes = payload.len(), "Received message");
                self.emit(TransportEvent::Message { topic, payload }).await;
                Flow::Continue
            }
            EventRoute::PublishAcknowledged { pkid } | EventRoute::PublishCompleted { pkid } => {
                lock_tracker(&self.tracker).on_publish_acknowledged(pkid);
                Flow::Continue
            }
            EventRoute::SubscriptionConfirmed { pkid, return_codes } => {
                let topic = lock_tracker(&self.tracker).on_subscription_acknowledged(pkid);
                let topic = topic.as_deref().unwrap_or("<unknown>");
                match MessageHandler::validate_subscription_success(&return_codes) {
                    Ok(()) => {
                        debug!(target: "mqtt_transport", topic, "Subscription confirmed")
                    }
                    Err(e) => error!(topic, "Broker rejected subscription: {}", e),
                }
                Flow::Continue
            }
            EventRoute::PingResponse => {
                self.ping_deadline = None;
                Flow::Continue
            }
            EventRoute::Disconnected => {
                Flow::ConnectionLost("broker sent DISCONNECT".to_string())
            }
            EventRoute::OutgoingPublish { pkid } => {
                lock_tracker(&self.tracker).on_outgoing_publish(pkid);
                Flow::Continue
            }
            EventRoute::OutgoingSubscribe { pkid } => {
                lock_tracker(&self.tracker).on_outgoing_subscribe(pkid);
                Flow::Continue
            }
            EventRoute::OutgoingPingRequest => {
                if self.ping_deadline.is_none() {
                    self.ping_deadline =
                        HealthMonitor::ping_deadline(Instant::now(), self.ping_timeout);
                }
                Flow::Continue
            }
            EventRoute::OutgoingDisconnect => {
                if self.closing.load(Ordering::SeqCst) {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                Flow::Continue
            }
            EventRoute::OutgoingEvent => Flow::Continue,
        }
    }

    async fn emit(&mut self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!(target: "mqtt_transport", "Event receiver dropped");
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.closing.load(Ordering::SeqCst)
    }

    /// Reconnect on a fixed delay; returns false when shutdown interrupted it
    async fn reconnect(&mut self, reason: String) -> bool {
        warn!(reason = %reason, "MQTT connection lost");
        self.ping_deadline = None;
        self.emit(TransportEvent::ConnectionLost(reason)).await;

        let mut attempts = 0u32;
        loop {
            match HealthMonitor::should_attempt_reconnection(
                attempts,
                &self.policy,
                self.shutdown_requested(),
            ) {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    attempts = attempt;
                    let max_display = if self.policy.max_attempts == 0 {
                        "∞".to_string()
                    } else {
                        self.policy.max_attempts.to_string()
                    };
                    info!(
                        "Attempting reconnection {}/{} after {:?} delay",
                        attempt, max_display, delay
                    );

                    if !interruptible_sleep(self.shutdown_rx.clone(), delay).await {
                        return false;
                    }
                    if self.shutdown_requested() {
                        info!("Shutdown signal received, aborting reconnection");
                        return false;
                    }
                    self.emit(TransportEvent::Reconnecting { attempt }).await;

                    let outcome = tokio::select! {
                        _ = self.shutdown_rx.changed() => return false,
                        outcome = tokio::time::timeout(
                            self.connect_timeout,
                            MqttTransport::wait_for_connack(&mut self.event_loop),
                        ) => outcome,
                    };

                    match outcome {
                        Ok(Ok(())) => {
                            info!(attempt, "Reconnected to MQTT broker");
                            self.emit(TransportEvent::Connected).await;
                            return true;
                        }
                        Ok(Err(e)) => {
                            warn!(attempt, "Reconnection attempt failed: {}", e);
                            self.emit(TransportEvent::ConnectionLost(e.to_string())).await;
                        }
                        Err(_) => {
                            warn!(attempt, "Reconnection attempt timed out");
                            self.event_loop.clean();
                            self.emit(TransportEvent::ConnectionLost(
                                "reconnect attempt timed out".to_string(),
                            ))
                            .await;
                        }
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    info!("Shutdown signal received, stopping reconnection");
                    return false;
                }
                ReconnectionDecision::CycleExhausted { attempts: spent, window } => {
                    warn!(
                        attempts = spent,
                        ?window,
                        "Reconnect cycle exhausted without success, starting a new cycle"
                    );
                    attempts = 0;
                }
            }
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                info!("Shutdown signal received during reconnection delay, stopping");
                return false;
            }
            true
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
