//! Pluggable transport layer.
//!
//! A [`Strategy`] is the channel abstraction the engine runs on: it can
//! publish a wire message, start and stop accepting inbound messages, and
//! raises a `"message"` event (plus arbitrary named events for lifecycle
//! signaling) through its [`Emitter`]. The engine behaves identically whether
//! the channel is a same-process call ([`LoopbackStrategy`]), a bridge
//! between two independent execution contexts ([`BridgeStrategy`]) or a test
//! double.
//!
//! Every inbound request envelope carries a *reply* strategy bound back to
//! the sender's channel handle, so responses and events can address the
//! original requester without a persistent server-initiated channel.

pub mod bridge;
pub mod loopback;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::error::Result;

pub use bridge::{BridgeConfig, BridgeStrategy, MessageHub};
pub use loopback::LoopbackStrategy;

/// Name of the event raised for every inbound wire message.
pub const MESSAGE_EVENT: &str = "message";

/// Buffered events per channel before slow receivers start lagging.
const EMITTER_CAPACITY: usize = 256;

/// An inbound wire message together with its delivery context.
#[derive(Clone)]
pub struct Inbound {
    /// The raw wire object
    pub data: Value,
    /// Identity of the sending channel, when the transport knows it
    pub origin: Option<String>,
    /// Strategy bound back to the sender, for responses and events
    pub reply: Option<Arc<dyn Strategy>>,
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("data", &self.data)
            .field("origin", &self.origin)
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

/// The transport contract.
///
/// `listen` and `close` are idempotent. Implementations raise
/// [`MESSAGE_EVENT`] on their emitter for every inbound message and may raise
/// arbitrary named events for transport-specific signaling.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Delivers a wire message to the remote side.
    async fn publish(&self, message: Value) -> Result<()>;

    /// Begins accepting inbound messages.
    async fn listen(&self) -> Result<()>;

    /// Stops accepting inbound messages.
    async fn close(&self) -> Result<()>;

    /// The event surface of this strategy.
    fn emitter(&self) -> &Emitter;
}

/// Named-event fan-out surface of a strategy.
///
/// Subscribers obtain a receiver per event name; emitting with no subscriber
/// drops the event. Cloning shares the underlying channels.
#[derive(Clone, Default)]
pub struct Emitter {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Inbound>>>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the named event, creating its channel on first use.
    pub fn on(&self, event: &str) -> broadcast::Receiver<Inbound> {
        let mut channels = self.channels.lock().expect("emitter lock poisoned");
        channels
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(EMITTER_CAPACITY).0)
            .subscribe()
    }

    /// Emits the named event to current subscribers, returning how many
    /// received it.
    pub fn emit(&self, event: &str, inbound: Inbound) -> usize {
        let channels = self.channels.lock().expect("emitter lock poisoned");
        match channels.get(event) {
            Some(sender) => sender.send(inbound).unwrap_or(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emitter_delivers_to_subscriber() {
        let emitter = Emitter::new();
        let mut rx = emitter.on(MESSAGE_EVENT);
        let delivered = emitter.emit(
            MESSAGE_EVENT,
            Inbound {
                data: json!({"x": 1}),
                origin: None,
                reply: None,
            },
        );
        assert_eq!(delivered, 1);
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.data, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_emitter_drops_without_subscriber() {
        let emitter = Emitter::new();
        let delivered = emitter.emit(
            "ping",
            Inbound {
                data: json!({}),
                origin: None,
                reply: None,
            },
        );
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_emitter_separates_named_events() {
        let emitter = Emitter::new();
        let mut ping_rx = emitter.on("ping");
        let _message_rx = emitter.on(MESSAGE_EVENT);
        emitter.emit(
            "ping",
            Inbound {
                data: json!({"kind": "ping"}),
                origin: None,
                reply: None,
            },
        );
        let inbound = ping_rx.recv().await.unwrap();
        assert_eq!(inbound.data, json!({"kind": "ping"}));
    }
}
