use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::protocol::error::{FramelinkError, Result};
use crate::protocol::message::{Kind, Manifest, WireObject};
use crate::protocol::request::Request;
use crate::transport::Strategy;

const KNOWN_FIELDS: &[&str] = &[
    "type",
    "code",
    "payload",
    "transactionId",
    "headers",
    "caller",
    "origin",
];

/// A response answering a request.
///
/// The transaction id of a response always equals the transaction id of the
/// request it answers; that equality is the sole correlation key. The reply
/// channel back-reference taken from the originating request is local-only
/// and never serialized.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "type")]
    kind: Kind,
    /// HTTP-style status code
    pub code: u16,
    /// Response body
    pub payload: Value,
    /// Correlation token copied from the answered request
    pub transaction_id: String,
    /// Response headers
    pub headers: HashMap<String, String>,
    /// Advisory descriptor of the emitting role
    pub caller: Manifest,
    /// Origin of the channel the response arrived on, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Unknown wire fields, preserved through reconstruction
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    reply: Option<Arc<dyn Strategy>>,
}

impl Response {
    /// Builds the response answering `request`: status 200, the request's
    /// transaction id, and the request's reply channel as the send target.
    pub fn for_request(request: &Request) -> Self {
        Response {
            kind: Kind::Response,
            code: 200,
            payload: json!({}),
            transaction_id: request.transaction_id.clone(),
            headers: HashMap::new(),
            caller: Manifest::server(),
            origin: None,
            extra: Map::new(),
            reply: request.reply_strategy().cloned(),
        }
    }

    /// Reconstructs a response from a raw wire object.
    ///
    /// Required fields: `type`, `transactionId`, `code`. `payload`, `headers`
    /// and `caller` receive their defaults when absent.
    pub fn from_wire(wire: Value) -> Result<Self> {
        let raw = WireObject::new(wire, Kind::Response)?;
        Ok(Response {
            kind: Kind::Response,
            code: raw.required_u16("code")?,
            payload: raw.value_or("payload", json!({})),
            transaction_id: raw.required_str("transactionId")?,
            headers: raw.string_map("headers"),
            caller: raw.caller_or(Manifest::server()),
            origin: raw.optional_str("origin"),
            extra: raw.into_extra(KNOWN_FIELDS),
            reply: None,
        })
    }

    /// Sets the status code.
    pub fn status(&mut self, code: u16) -> &mut Self {
        self.code = code;
        self
    }

    /// Sets a header, replacing any previous value.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Header value for `key`, if set.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Canonical flat wire projection of this response.
    pub fn serialize(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Sends this response back over the reply channel with the given status
    /// code and payload, stamping the `Server` header. Sending terminates the
    /// interaction for this request; a response without a reply channel
    /// cannot be sent.
    pub async fn send(&mut self, code: u16, payload: Value) -> Result<()> {
        self.code = code;
        self.payload = payload;
        let agent = self.caller.agent();
        self.set_header("Server", agent);
        let reply = self
            .reply
            .clone()
            .ok_or_else(|| FramelinkError::Transport("response has no reply channel".to_string()))?;
        reply.publish(Response::serialize(self)).await
    }

    /// Sends with status 200.
    pub async fn send_ok(&mut self, payload: Value) -> Result<()> {
        self.send(200, payload).await
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("code", &self.code)
            .field("transaction_id", &self.transaction_id)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}
