use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::error::Result;
use crate::protocol::message::{new_transaction_id, Kind, Manifest, WireObject};

const KNOWN_FIELDS: &[&str] = &[
    "type",
    "resource",
    "payload",
    "transactionId",
    "headers",
    "caller",
    "subscriptionId",
    "origin",
];

/// An event published for a resource to its subscribers.
///
/// `subscription_id` names the subscription instance that triggered this
/// delivery; it is absent for transport-level first-contact events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    kind: Kind,
    /// Resource the event was published on
    pub resource: String,
    /// Event body
    pub payload: Value,
    /// Unique token identifying this emission
    pub transaction_id: String,
    /// Event headers
    pub headers: HashMap<String, String>,
    /// Advisory descriptor of the emitting role
    pub caller: Manifest,
    /// Subscription instance that triggered delivery, when addressed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Origin of the channel the event arrived on, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Unknown wire fields, preserved through reconstruction
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Builds an originating event for `resource`.
    pub fn new(resource: impl Into<String>, payload: Value, subscription_id: Option<String>) -> Self {
        Event {
            kind: Kind::Event,
            resource: resource.into(),
            payload,
            transaction_id: new_transaction_id(),
            headers: HashMap::new(),
            caller: Manifest::emitter(),
            subscription_id,
            origin: None,
            extra: Map::new(),
        }
    }

    /// Reconstructs an event from a raw wire object.
    ///
    /// Required fields: `type`, `resource`, `transactionId`. `payload`,
    /// `headers` and `caller` receive their defaults when absent.
    pub fn from_wire(wire: Value) -> Result<Self> {
        let raw = WireObject::new(wire, Kind::Event)?;
        Ok(Event {
            kind: Kind::Event,
            resource: raw.required_str("resource")?,
            payload: raw.value_or("payload", Value::Object(Map::new())),
            transaction_id: raw.required_str("transactionId")?,
            headers: raw.string_map("headers"),
            caller: raw.caller_or(Manifest::emitter()),
            subscription_id: raw.optional_str("subscriptionId"),
            origin: raw.optional_str("origin"),
            extra: raw.into_extra(KNOWN_FIELDS),
        })
    }

    /// Canonical flat wire projection of this event.
    pub fn serialize(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
