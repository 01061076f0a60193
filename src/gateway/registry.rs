//! Concurrency-safe topic to handler map
//!
//! Keys are exact topic strings; there is no wildcard matching on lookup. A
//! second registration for the same topic replaces the first.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Callback invoked with the topic and raw payload of an inbound message
pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Topic to handler map guarded by a readers-writer lock
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Handlers never run under the lock; a poisoned map is still consistent
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Handler>> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install or replace the handler for `topic`
    pub fn register<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.register_arc(topic, Arc::new(handler));
    }

    pub fn register_arc(&self, topic: impl Into<String>, handler: Handler) {
        let topic = topic.into();
        let replaced = self.write().insert(topic.clone(), handler).is_some();
        debug!(topic = %topic, replaced, "Registered handler");
    }

    /// Exact-match lookup; the returned handle outlives the lock
    pub fn lookup(&self, topic: &str) -> Option<Handler> {
        self.read().get(topic).cloned()
    }

    pub fn unregister(&self, topic: &str) -> bool {
        self.write().remove(topic).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registered topics in sorted order
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}
