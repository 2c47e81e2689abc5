//! In-process publish/subscribe dispatcher for domain events
//!
//! Delivery is synchronous on the publisher's task, in registration order.
//! Handlers must be fast: anything slow belongs on a channel drained by a
//! background task. A failing or panicking handler is logged and skipped.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::topic;

/// Immutable domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Publish order within this process
    pub sequence: u64,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(#{} topic={}, source={})",
            self.sequence, self.topic, self.source
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Handler,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_errors: u64,
    pub subscribers: usize,
}

pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    sequence: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }
    }

    /// Subscribe to an exact topic, a `prefix.*` pattern, or `*`
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });

        debug!(pattern = %pattern, id = id.0, "Subscribed to events");
        id
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    /// Build an event and deliver it to every matching handler
    pub fn publish(&self, topic: &str, payload: serde_json::Value, source: &str) -> Event {
        let event = Event {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
            source: source.to_string(),
        };
        self.dispatch(&event);
        event
    }

    /// Deliver an already-formed event (e.g. one received from a remote peer)
    pub fn dispatch(&self, event: &Event) {
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot handlers so they can publish or subscribe re-entrantly
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| topic::matches(&s.pattern, &event.topic))
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %event.topic, subscription = id.0, "Event handler failed: {:#}", e);
                }
                Err(_) => {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(topic = %event.topic, subscription = id.0, "Event handler panicked");
                }
            }
        }
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            subscribers: self.subscriptions.read().len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
