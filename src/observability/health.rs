//! Health check HTTP server
//!
//! Serves the gateway's last known connection state for operators and container
//! orchestration. The server only reads a watch receiver; it never touches the
//! broker session.

use crate::gateway::ConnectionState;
use crate::observability::metrics::GatewayMetrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    version: String,
    state_rx: watch::Receiver<ConnectionState>,
    metrics: Arc<GatewayMetrics>,
}

impl HealthServer {
    pub fn new(
        port: u16,
        version: String,
        state_rx: watch::Receiver<ConnectionState>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            port,
            version,
            state_rx,
            metrics,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current `/health` document and its HTTP status
    pub fn health_status(&self) -> (HealthStatus, StatusCode) {
        let state = *self.state_rx.borrow();
        let (status, code) = if state.is_connected() {
            ("up", StatusCode::OK)
        } else {
            ("down", StatusCode::SERVICE_UNAVAILABLE)
        };

        (
            HealthStatus {
                status: status.to_string(),
                timestamp: current_timestamp(),
                version: self.version.clone(),
            },
            code,
        )
    }

    /// All routes served by the health server
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();
        let metrics_server = self.clone();

        // GET /health - connection status
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = health_server.clone();
                async move {
                    let (status, code) = server.health_status();
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /ready - readiness check
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = ready_server.clone();
                async move {
                    let ready = server.state_rx.borrow().is_connected();
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&response),
                        code,
                    ))
                }
            });

        // GET /live - liveness check
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        // GET /metrics - counters snapshot
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || warp::reply::json(&metrics_server.metrics.snapshot()));

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = BTreeMap::from([
                ("/health", "Connection status with version"),
                ("/ready", "Readiness check"),
                ("/live", "Liveness check"),
                ("/metrics", "Connection and message counters"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
            .or(root_route)
    }

    /// Bind the port and serve until the task is dropped
    pub async fn start(self: Arc<Self>) -> Result<(), warp::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) = warp::serve(self.routes()).try_bind_ephemeral(addr)?;
        tracing::info!("Health server listening on {}", bound);
        server.await;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
