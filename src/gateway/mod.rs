//! The gateway: connection lifecycle, handler dispatch and status publication
//!
//! [`Gateway`] is the explicitly built context that ties the pieces together. It
//! owns the configuration, the metrics, the [`ConnectionManager`] and the health
//! server; nothing in the crate lives in a process-wide global.

pub mod dispatcher;
pub mod manager;
pub mod payload;
pub mod registry;
pub mod state;
pub mod status;

pub use dispatcher::{process_event, DispatchOutcome, Dispatcher};
pub use manager::ConnectionManager;
pub use payload::Payload;
pub use registry::{Handler, HandlerRegistry};
pub use state::ConnectionState;
pub use status::StatusDocument;

use crate::config::{GatewayConfig, QosLevel};
use crate::error::GatewayResult;
use crate::lifecycle_span;
use crate::observability::{GatewayMetrics, HealthServer};
use crate::transport::mqtt::{MqttTransport, TopicBuilder};
use crate::transport::{DefaultTransport, TlsContext, Transport};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Explicitly built gateway context
pub struct Gateway<T: Transport = DefaultTransport> {
    config: GatewayConfig,
    version: String,
    metrics: Arc<GatewayMetrics>,
    manager: ConnectionManager<T>,
    health: Arc<HealthServer>,
    health_task: Option<JoinHandle<()>>,
}

impl Gateway<DefaultTransport> {
    /// Build a gateway that talks to a real broker
    pub fn build(config: GatewayConfig) -> GatewayResult<Self> {
        Self::with_transport(config, MqttTransport::new())
    }
}

impl<T: Transport> Gateway<T> {
    /// Validate configuration, load TLS material and wire the components
    ///
    /// Fails on invalid configuration or unreadable certificates; no network
    /// activity happens here.
    pub fn with_transport(config: GatewayConfig, transport: T) -> GatewayResult<Self> {
        config.validate()?;
        let tls = TlsContext::from_session(&config.mqtt)?;

        let version = config.gateway.reported_version();
        let metrics = Arc::new(GatewayMetrics::new());
        let manager = ConnectionManager::new(
            config.mqtt.clone(),
            tls,
            transport,
            Arc::new(HandlerRegistry::new()),
            metrics.clone(),
        );
        let health = Arc::new(HealthServer::new(
            config.gateway.health_port,
            version.clone(),
            manager.state_receiver(),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            version,
            metrics,
            manager,
            health,
            health_task: None,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ConnectionManager<T> {
        &mut self.manager
    }

    pub fn health(&self) -> &Arc<HealthServer> {
        &self.health
    }

    pub fn status_topic(&self) -> String {
        TopicBuilder::build_status_topic(&self.config.gateway.topic_prefix)
    }

    pub fn commands_topic(&self) -> String {
        TopicBuilder::build_commands_topic(&self.config.gateway.topic_prefix)
    }

    /// Serve the health endpoint in a background task
    pub fn spawn_health_server(&mut self) {
        if self.health_task.is_some() {
            return;
        }
        let server = self.health.clone();
        self.health_task = Some(tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Health server failed: {}", e);
            }
        }));
    }

    /// Connect, start command intake and announce the gateway as online
    pub async fn start(&mut self) -> GatewayResult<()> {
        let span = lifecycle_span!(event = "startup", version = %self.version);
        async {
            let commands_topic = self.commands_topic();
            self.manager.register_handler(commands_topic.clone(), |topic, payload| {
                info!(
                    topic,
                    command = %String::from_utf8_lossy(payload),
                    "Received command"
                );
            });
            self.manager.subscribe(&commands_topic).await?;

            self.manager.connect().await?;

            let status = StatusDocument::online(&self.version);
            if let Err(e) = self.publish_status(&status).await {
                warn!("Failed to publish online status: {}", e);
            }

            info!(
                status_topic = %self.status_topic(),
                commands_topic = %commands_topic,
                "Gateway started"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn publish_status(&self, status: &StatusDocument) -> GatewayResult<()> {
        let payload = Payload::json(status)?;
        self.manager
            .publish_with(&self.status_topic(), payload, QosLevel::AtLeastOnce, false)
            .await
    }

    /// Announce the gateway as offline (best effort) and close the session
    pub async fn shutdown(&mut self) -> GatewayResult<()> {
        let span = lifecycle_span!(event = "shutdown");
        async {
            if self.manager.state().is_connected() {
                let status = StatusDocument::offline(&self.version);
                if let Err(e) = self.publish_status(&status).await {
                    warn!("Failed to publish offline status: {}", e);
                }
            }

            self.manager.disconnect().await?;

            if let Some(handle) = self.health_task.take() {
                handle.abort();
            }
            info!("Gateway stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
