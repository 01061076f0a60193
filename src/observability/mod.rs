//! Observability: structured logging, metrics and the health endpoint

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{GatewayMetrics, MetricsSnapshot};

pub use logging::{lifecycle_span, mqtt_span};
