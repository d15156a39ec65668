//! Client-side subscription state.
//!
//! The client performs only one network subscription per resource and fans
//! events out locally: every callback registered against a resource shares
//! the subscription id returned by the first network subscribe. The callback
//! list is the local reference count; the entry disappears when it empties,
//! and the keepalive stops when no resource remains subscribed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use framelink_common::Event;

/// Callback invoked for every event delivered on a subscribed resource.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Subscribe acknowledgment payload.
///
/// Older servers answer with `{ topic, id }` instead of
/// `{ resource, subscriptionId }`; both field-name conventions decode.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubscribeAck {
    #[serde(alias = "topic")]
    pub resource: String,
    #[serde(alias = "id")]
    pub subscription_id: String,
}

pub(crate) struct ResourceSubscription {
    pub subscription_id: String,
    pub callbacks: Vec<EventCallback>,
}

/// Outcome of removing a callback from a resource's list.
pub(crate) enum RemoveOutcome {
    /// No subscription exists for the resource at all
    NotSubscribed,
    /// Other callbacks remain; no network traffic needed
    Remaining,
    /// The list emptied: the entry is gone and the network subscription
    /// under this id must be torn down
    Empty { subscription_id: String },
}

/// The per-client map of `resource -> (subscription id, callbacks)`.
#[derive(Default)]
pub(crate) struct SubscriptionState {
    entries: HashMap<String, ResourceSubscription>,
}

impl SubscriptionState {
    /// Appends `callback` under the existing shared subscription id, when the
    /// resource already has local subscribers.
    pub fn append_existing(&mut self, resource: &str, callback: &EventCallback) -> bool {
        match self.entries.get_mut(resource) {
            Some(entry) => {
                entry.callbacks.push(Arc::clone(callback));
                true
            }
            None => false,
        }
    }

    /// Installs the first local subscription for `resource`.
    pub fn insert(&mut self, resource: &str, subscription_id: String, callback: EventCallback) {
        self.entries.insert(
            resource.to_string(),
            ResourceSubscription {
                subscription_id,
                callbacks: vec![callback],
            },
        );
    }

    /// Removes the callback matching `callback` by identity.
    pub fn remove(&mut self, resource: &str, callback: &EventCallback) -> RemoveOutcome {
        let Some(entry) = self.entries.get_mut(resource) else {
            return RemoveOutcome::NotSubscribed;
        };
        entry
            .callbacks
            .retain(|registered| !Arc::ptr_eq(registered, callback));
        if entry.callbacks.is_empty() {
            let subscription_id = entry.subscription_id.clone();
            self.entries.remove(resource);
            RemoveOutcome::Empty { subscription_id }
        } else {
            RemoveOutcome::Remaining
        }
    }

    /// Callbacks registered for `resource`; events dispatch to all of them
    /// regardless of which subscription instance triggered delivery.
    pub fn callbacks_for(&self, resource: &str) -> Vec<EventCallback> {
        self.entries
            .get(resource)
            .map(|entry| entry.callbacks.clone())
            .unwrap_or_default()
    }

    /// Every currently-subscribed resource, for the batched keepalive ping.
    pub fn resources(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
