//! Framelink Client
//!
//! This crate provides the client side of the Framelink engine: verb-based
//! request issuing with transaction correlation and timeouts, and the
//! reference-counted subscription layer with its keepalive.
//!
//! # Example
//!
//! ```no_run
//! use framelink_client::{Client, RequestOptions};
//! use framelink_common::transport::LoopbackStrategy;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> framelink_common::Result<()> {
//! let strategy = LoopbackStrategy::new();
//! let client = Client::new(strategy).await?;
//!
//! let response = client.get("/user/42?verbose=1", RequestOptions::default()).await?;
//! assert_eq!(response.code, 200);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod subscriptions;

pub use client::{Client, ClientConfig, RequestOptions};
pub use subscriptions::EventCallback;
