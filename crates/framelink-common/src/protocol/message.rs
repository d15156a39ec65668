//! Shared message-model pieces: the caller manifest, message kinds, the verb
//! set, transaction-id generation and the wire-object field contract used by
//! the `from_wire` constructors.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::error::{FramelinkError, Result};

/// Protocol name advertised in every caller manifest.
pub const PROTOCOL_NAME: &str = "framelink";

/// Protocol version advertised in every caller manifest.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Advisory descriptor of the role that emitted a message.
///
/// The manifest identifies the emitting side (client, server or event
/// emitter) and the protocol version it speaks. It is informational only and
/// never a trust boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Role that emitted the message
    pub emitter: String,
    /// Protocol name
    pub protocol: String,
    /// Protocol version string
    pub version: String,
}

impl Manifest {
    fn for_role(role: &str) -> Self {
        Manifest {
            emitter: role.to_string(),
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Manifest of the client role.
    pub fn client() -> Self {
        Self::for_role("client")
    }

    /// Manifest of the server role.
    pub fn server() -> Self {
        Self::for_role("server")
    }

    /// Manifest of the event-emitter role.
    pub fn emitter() -> Self {
        Self::for_role("emitter")
    }

    /// `emitter/version` token used for `User-Agent` / `Server` headers.
    pub fn agent(&self) -> String {
        format!("{}/{}", self.emitter, self.version)
    }
}

/// The three message kinds carried on the wire in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Event,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Event => "event",
        }
    }

    /// Sniffs the kind of a raw wire object without fully decoding it.
    pub fn of(wire: &Value) -> Option<Kind> {
        match wire.get("type").and_then(Value::as_str) {
            Some("request") => Some(Kind::Request),
            Some("response") => Some(Kind::Response),
            Some("event") => Some(Kind::Event),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The enumerated verb set.
///
/// `Subscribe`, `Unsubscribe` and `Ping` are reserved for the protocol: the
/// server intercepts them before user routing. The remaining verbs are
/// conventional and routed like their HTTP namesakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Head,
    Delete,
    Options,
    Subscribe,
    Unsubscribe,
    Ping,
}

impl Method {
    /// The conventional (user-routable) verbs.
    pub const VERBS: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Head,
        Method::Delete,
        Method::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
            Method::Put => "put",
            Method::Patch => "patch",
            Method::Head => "head",
            Method::Delete => "delete",
            Method::Options => "options",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Ping => "ping",
        }
    }

    /// Whether the verb is intercepted by the server before user routing.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Method::Subscribe | Method::Unsubscribe | Method::Ping)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "get" => Ok(Method::Get),
            "post" => Ok(Method::Post),
            "put" => Ok(Method::Put),
            "patch" => Ok(Method::Patch),
            "head" => Ok(Method::Head),
            "delete" => Ok(Method::Delete),
            "options" => Ok(Method::Options),
            "subscribe" => Ok(Method::Subscribe),
            "unsubscribe" => Ok(Method::Unsubscribe),
            "ping" => Ok(Method::Ping),
            _ => Err(()),
        }
    }
}

/// A fresh 128-bit random transaction token.
pub fn new_transaction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Splits a resource string into its path component and the query mapping
/// parsed from it. The query is always produced, possibly empty; a missing or
/// empty path normalizes to `/`.
pub fn split_resource(resource: &str) -> (String, HashMap<String, String>) {
    let resource = resource.split_once('#').map_or(resource, |(r, _)| r);
    let (path, query) = match resource.split_once('?') {
        Some((path, qs)) => (path, parse_query(qs)),
        None => (resource, HashMap::new()),
    };
    let path = if path.is_empty() { "/" } else { path };
    (path.to_string(), query)
}

/// Parses a query string into a key/value mapping. Later duplicate keys win.
pub fn parse_query(qs: &str) -> HashMap<String, String> {
    let mut query = HashMap::new();
    for pair in qs.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(percent_decode(key), percent_decode(value));
    }
    query
}

/// Decodes `%XX` escapes and `+` separators; malformed escapes pass through.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                match bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                    }
                    None => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }
    match String::from_utf8(decoded) {
        Ok(s) => s,
        // Escapes that do not form valid UTF-8: fall back to the raw input.
        Err(_) => input.to_string(),
    }
}

/// A raw wire object being reconstructed into a typed message.
///
/// Validation rejects only missing required fields, never unknown extras;
/// whatever is not consumed by the typed fields is preserved verbatim so a
/// reconstructed message round-trips foreign fields.
pub(crate) struct WireObject {
    kind: &'static str,
    map: Map<String, Value>,
}

impl WireObject {
    /// Wraps a wire value, failing if it is not an object of the expected
    /// message kind.
    pub fn new(wire: Value, expected: Kind) -> Result<Self> {
        let kind = expected.as_str();
        let map = match wire {
            Value::Object(map) => map,
            _ => return Err(FramelinkError::missing(kind, "type")),
        };
        match map.get("type").and_then(Value::as_str) {
            Some(tag) if tag == kind => Ok(WireObject { kind, map }),
            _ => Err(FramelinkError::missing(kind, "type")),
        }
    }

    pub fn required_str(&self, field: &'static str) -> Result<String> {
        self.map
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(FramelinkError::missing(self.kind, field))
    }

    pub fn required_u16(&self, field: &'static str) -> Result<u16> {
        self.map
            .get(field)
            .and_then(Value::as_u64)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or(FramelinkError::missing(self.kind, field))
    }

    pub fn optional_str(&self, field: &str) -> Option<String> {
        self.map.get(field).and_then(Value::as_str).map(str::to_string)
    }

    /// Field value with a default when absent.
    pub fn value_or(&self, field: &str, default: Value) -> Value {
        self.map.get(field).cloned().unwrap_or(default)
    }

    /// String map field, defaulting to empty and skipping non-string values.
    pub fn string_map(&self, field: &str) -> HashMap<String, String> {
        match self.map.get(field) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => HashMap::new(),
        }
    }

    /// Caller manifest, defaulting to the given role manifest when absent or
    /// malformed, exactly like an originating constructor would.
    pub fn caller_or(&self, default: Manifest) -> Manifest {
        match self.map.get("caller") {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or(default),
            None => default,
        }
    }

    /// Consumes the wire object, returning every field not named in `known`.
    pub fn into_extra(self, known: &[&str]) -> Map<String, Value> {
        self.map
            .into_iter()
            .filter(|(key, _)| !known.contains(&key.as_str()))
            .collect()
    }
}
