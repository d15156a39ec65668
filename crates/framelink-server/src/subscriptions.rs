//! Server-side subscription registry and event fan-out.
//!
//! Subscriptions are keyed by `(resource, subscription id)` and hold the
//! reply strategy of the subscriber. There is no server-side expiry: liveness
//! is the client's responsibility through its keepalive pings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use framelink_common::{Event, Strategy};

/// Outcome of a publish fan-out: every per-subscriber send is awaited, none
/// short-circuits the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Sends that completed
    pub delivered: usize,
    /// Sends that failed (logged, not returned as errors)
    pub failed: usize,
}

/// Registry of active subscriptions per resource.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<HashMap<String, HashMap<String, Arc<dyn Strategy>>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber's reply channel for `resource`, returning the
    /// fresh subscription id.
    pub fn subscribe(&self, resource: &str, reply: Arc<dyn Strategy>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .entry(resource.to_string())
            .or_default()
            .insert(id.clone(), reply);
        debug!(resource, subscription = %id, "subscription registered");
        id
    }

    /// Removes the subscription `(resource, id)`; `false` when absent.
    pub fn unsubscribe(&self, resource: &str, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(subscribers) = inner.get_mut(resource) else {
            return false;
        };
        let removed = subscribers.remove(id).is_some();
        if subscribers.is_empty() {
            inner.remove(resource);
        }
        removed
    }

    /// Number of active subscriptions for `resource`.
    pub fn count(&self, resource: &str) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.get(resource).map_or(0, HashMap::len)
    }

    /// Fans `payload` out as an [`Event`] to every subscriber of `resource`,
    /// concurrently, settling every send. Zero subscribers is a no-op
    /// success.
    pub async fn publish(&self, resource: &str, payload: Value) -> PublishReport {
        let subscribers: Vec<(String, Arc<dyn Strategy>)> = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            match inner.get(resource) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(id, reply)| (id.clone(), Arc::clone(reply)))
                    .collect(),
                None => return PublishReport::default(),
            }
        };

        let sends = subscribers.into_iter().map(|(id, reply)| {
            let event = Event::new(resource, payload.clone(), Some(id.clone()));
            async move {
                let sent = reply.publish(event.serialize()).await;
                if let Err(ref error) = sent {
                    warn!(resource = %event.resource, subscription = %id, %error,
                        "event delivery failed");
                }
                sent
            }
        });

        let outcomes = join_all(sends).await;
        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        PublishReport {
            delivered: outcomes.len() - failed,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_common::transport::LoopbackStrategy;
    use framelink_common::MESSAGE_EVENT;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop_success() {
        let registry = SubscriptionRegistry::new();
        let report = registry.publish("/topic", json!({"x": 1})).await;
        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let registry = SubscriptionRegistry::new();
        let strategy = LoopbackStrategy::new();
        strategy.listen().await.unwrap();
        let mut rx = strategy.emitter().on(MESSAGE_EVENT);

        let first = registry.subscribe("/topic", strategy.clone());
        let second = registry.subscribe("/topic", strategy.clone());
        assert_ne!(first, second);

        let report = registry.publish("/topic", json!({"n": 7})).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);

        for _ in 0..2 {
            let inbound = rx.recv().await.unwrap();
            assert_eq!(inbound.data["type"], "event");
            assert_eq!(inbound.data["resource"], "/topic");
            assert_eq!(inbound.data["payload"]["n"], 7);
        }
    }

    #[tokio::test]
    async fn test_failed_sends_are_settled_not_short_circuited() {
        let registry = SubscriptionRegistry::new();
        let healthy = LoopbackStrategy::new();
        healthy.listen().await.unwrap();
        let broken = LoopbackStrategy::new(); // never listens, publish fails

        registry.subscribe("/topic", broken);
        registry.subscribe("/topic", healthy.clone());

        let report = registry.publish("/topic", json!({})).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_false() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.unsubscribe("/topic", "missing"));

        let strategy = LoopbackStrategy::new();
        let id = registry.subscribe("/topic", strategy);
        assert!(registry.unsubscribe("/topic", &id));
        assert!(!registry.unsubscribe("/topic", &id));
        assert_eq!(registry.count("/topic"), 0);
    }
}
