//! Inbound message dispatch
//!
//! Every message from the transport goes through [`Dispatcher::on_message`]: a
//! registered handler for the exact topic runs if there is one, otherwise the
//! default processing path does.

use super::registry::HandlerRegistry;
use crate::observability::metrics::GatewayMetrics;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// What happened to a dispatched message
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A registered handler ran to completion
    Handled,
    /// No handler matched; carries the default processing result
    Processed(String),
    /// The registered handler panicked
    HandlerFailed,
}

/// Default processing for messages without a handler
pub fn process_event(payload: &[u8]) -> String {
    format!("Processed: {}", String::from_utf8_lossy(payload))
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn on_message(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        self.metrics.message_received();

        let Some(handler) = self.registry.lookup(topic) else {
            let result = process_event(payload);
            info!(topic, result = %result, "Processed message without handler");
            self.metrics.message_default_processed();
            return DispatchOutcome::Processed(result);
        };

        match catch_unwind(AssertUnwindSafe(|| handler(topic, payload))) {
            Ok(()) => {
                debug!(topic, bytes = payload.len(), "Handler completed");
                self.metrics.message_handled();
                DispatchOutcome::Handled
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(topic, reason = %reason, "Message handler panicked");
                self.metrics.handler_failed();
                DispatchOutcome::HandlerFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(HandlerRegistry::new()),
            Arc::new(GatewayMetrics::new()),
        )
    }

    #[test]
    fn test_process_event() {
        assert_eq!(process_event(b"temp=21"), "Processed: temp=21");
        assert_eq!(process_event(b""), "Processed: ");
    }

    #[test]
    fn test_unhandled_topic_uses_default_path() {
        let dispatcher = dispatcher();
        let outcome = dispatcher.on_message("edge/node-1/data", b"23.5");
        assert_eq!(outcome, DispatchOutcome::Processed("Processed: 23.5".to_string()));
        assert_eq!(dispatcher.metrics.snapshot().messages.default_processed, 1);
    }

    #[test]
    fn test_registered_handler_replaces_default_path() {
        let dispatcher = dispatcher();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.registry().register("edge/node-1/data", move |topic, payload| {
            sink.lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
        });

        let outcome = dispatcher.on_message("edge/node-1/data", b"23.5");

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("edge/node-1/data".to_string(), b"23.5".to_vec())]
        );
        assert_eq!(dispatcher.metrics.snapshot().messages.default_processed, 0);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let dispatcher = dispatcher();
        dispatcher
            .registry()
            .register("boom", |_, _| panic!("handler exploded"));
        dispatcher.registry().register("fine", |_, _| {});

        assert_eq!(dispatcher.on_message("boom", b"x"), DispatchOutcome::HandlerFailed);
        assert_eq!(dispatcher.on_message("fine", b"x"), DispatchOutcome::Handled);
        assert_eq!(dispatcher.registry().len(), 2);
        assert_eq!(dispatcher.metrics.snapshot().messages.handler_failures, 1);
    }
}
