//! Framelink Common Types, Cache and Transport Contract
//!
//! This crate provides the shared protocol layer for the Framelink
//! request/response/event engine, which lets two isolated execution contexts
//! talk to each other as if one exposed a small RESTful service to the other
//! over an arbitrary one-way-at-a-time message channel.
//!
//! # Components
//!
//! - [`protocol`] - The three message kinds (Request, Response, Event), their
//!   wire projection and reconstruction, and the error taxonomy
//! - [`cache`] - The time-bounded correlation cache used to match responses
//!   to in-flight requests and to memoize one-time channel setups
//! - [`transport`] - The pluggable [`transport::Strategy`] contract plus the
//!   in-process reference implementations ([`transport::BridgeStrategy`] and
//!   [`transport::LoopbackStrategy`])
//!
//! # Example
//!
//! ```
//! use framelink_common::{Method, Request, Response};
//! use serde_json::json;
//!
//! // Build an originating request; the transaction id is generated.
//! let request = Request::new(Method::Get, "/user/42?verbose=1")
//!     .with_payload(json!({"fields": ["name"]}));
//! assert_eq!(request.resource, "/user/42");
//! assert_eq!(request.query.get("verbose").map(String::as_str), Some("1"));
//!
//! // The response answering it carries the same transaction id.
//! let response = Response::for_request(&request);
//! assert_eq!(response.transaction_id, request.transaction_id);
//! assert_eq!(response.code, 200);
//! ```

pub mod cache;
pub mod protocol;
pub mod transport;

pub use cache::{PutOptions, TtlCache};
pub use protocol::{Event, FramelinkError, Kind, Manifest, Method, Request, Response, Result};
pub use transport::{Emitter, Inbound, Strategy, MESSAGE_EVENT};
