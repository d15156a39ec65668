//! Framelink Server
//!
//! This crate provides the server side of the Framelink engine: the resource
//! router, the middleware chain dispatcher, the subscription registry and the
//! [`Server`] façade composing them over a transport strategy.
//!
//! # Example
//!
//! ```no_run
//! use framelink_common::transport::LoopbackStrategy;
//! use framelink_server::Server;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> framelink_common::Result<()> {
//! let strategy = LoopbackStrategy::new();
//! let server = Server::new(strategy);
//!
//! server.get("/user/:id", |req, mut res, _next| async move {
//!     let id = req.params.get("id").cloned().unwrap_or_default();
//!     let _ = res.send(200, json!({ "id": id })).await;
//! })?;
//!
//! server.listen().await?;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod router;
pub mod server;
pub mod subscriptions;

pub use chain::{Chain, Next};
pub use router::{ResourceRouter, RouteOptions};
pub use server::Server;
pub use subscriptions::{PublishReport, SubscriptionRegistry};
