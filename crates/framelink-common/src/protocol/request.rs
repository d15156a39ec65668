use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::protocol::error::Result;
use crate::protocol::message::{
    new_transaction_id, split_resource, Kind, Manifest, Method, WireObject,
};
use crate::transport::{Inbound, Strategy};

/// Wire fields consumed by the typed projection; everything else is kept in
/// `extra` for forward compatibility.
const KNOWN_FIELDS: &[&str] = &[
    "type",
    "resource",
    "method",
    "payload",
    "transactionId",
    "headers",
    "caller",
    "query",
    "origin",
];

/// A request addressed to a resource on the remote side.
///
/// Requests are either *originated* (built locally with [`Request::new`],
/// which generates a fresh transaction id) or *reconstructed* from a raw wire
/// object ([`Request::from_wire`]), which preserves the original transaction
/// id exactly. The `resource` never contains a query component; the query
/// mapping is parsed out of the resource string at construction and is always
/// present, possibly empty.
///
/// # Example
///
/// ```
/// use framelink_common::{Method, Request};
///
/// let req = Request::new(Method::Get, "/user/42?verbose=1");
/// assert_eq!(req.resource, "/user/42");
/// assert_eq!(req.method, "get");
/// assert_eq!(req.query.get("verbose").map(String::as_str), Some("1"));
/// ```
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(rename = "type")]
    kind: Kind,
    /// Absolute path of the addressed resource, query stripped
    pub resource: String,
    /// Verb, including the protocol-reserved `subscribe`/`unsubscribe`/`ping`
    pub method: String,
    /// Request body
    pub payload: Value,
    /// Correlation token; copied onto the answering response
    pub transaction_id: String,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Advisory descriptor of the emitting role
    pub caller: Manifest,
    /// Query parameters parsed from the resource string
    pub query: HashMap<String, String>,
    /// Path-pattern captures, populated by the router once routed
    #[serde(skip)]
    pub params: HashMap<String, String>,
    /// Origin of the channel the request arrived on, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Unknown wire fields, preserved through reconstruction
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    reply: Option<Arc<dyn Strategy>>,
}

impl Request {
    /// Builds an originating request for the given verb and resource string.
    ///
    /// The query component of `resource` is parsed into `query`, a fresh
    /// transaction id is generated and a `User-Agent` header is stamped from
    /// the client manifest.
    pub fn new(method: Method, resource: &str) -> Self {
        let (path, query) = split_resource(resource);
        let caller = Manifest::client();
        let agent = caller.agent();
        let mut request = Request {
            kind: Kind::Request,
            resource: path,
            method: method.as_str().to_string(),
            payload: json!({}),
            transaction_id: new_transaction_id(),
            headers: HashMap::new(),
            caller,
            query,
            params: HashMap::new(),
            origin: None,
            extra: Map::new(),
            reply: None,
        };
        request.set_header("User-Agent", agent);
        request
    }

    /// Replaces the request payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Reconstructs a request from a raw wire object.
    ///
    /// Required fields: `type`, `resource`, `method`, `transactionId`.
    /// `payload`, `headers` and `caller` receive their defaults when absent;
    /// `query` is re-derived from the resource string if not already present.
    /// The path component of `resource` is recovered in all cases.
    pub fn from_wire(wire: Value) -> Result<Self> {
        let raw = WireObject::new(wire, Kind::Request)?;
        let (path, derived_query) = split_resource(&raw.required_str("resource")?);
        // Keep an already-present query mapping; otherwise re-derive it from
        // the resource string.
        let query = if raw.value_or("query", Value::Null).is_object() {
            raw.string_map("query")
        } else {
            derived_query
        };
        Ok(Request {
            kind: Kind::Request,
            resource: path,
            method: raw.required_str("method")?,
            payload: raw.value_or("payload", json!({})),
            transaction_id: raw.required_str("transactionId")?,
            headers: raw.string_map("headers"),
            caller: raw.caller_or(Manifest::client()),
            query,
            params: HashMap::new(),
            origin: raw.optional_str("origin"),
            extra: raw.into_extra(KNOWN_FIELDS),
            reply: None,
        })
    }

    /// Reconstructs a request from an inbound transport envelope, binding the
    /// envelope's reply strategy and origin to it.
    pub fn from_inbound(inbound: Inbound) -> Result<Self> {
        let mut request = Request::from_wire(inbound.data)?;
        if request.origin.is_none() {
            request.origin = inbound.origin;
        }
        request.reply = inbound.reply;
        Ok(request)
    }

    /// The reply strategy bound to this request's sender, if any.
    pub fn reply_strategy(&self) -> Option<&Arc<dyn Strategy>> {
        self.reply.as_ref()
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

    /// Canonical flat wire projection of this request.
    ///
    /// Used both for transmission and for user-facing echoing; `params` and
    /// the reply binding are local-only and never serialized.
    pub fn serialize(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("resource", &self.resource)
            .field("method", &self.method)
            .field("transaction_id", &self.transaction_id)
            .field("query", &self.query)
            .field("params", &self.params)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}
