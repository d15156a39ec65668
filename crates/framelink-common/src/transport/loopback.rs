//! Same-process channel: published messages re-enter as inbound messages on
//! the same strategy instance, with the instance itself as the reply channel.
//! A client and a server sharing one loopback instance talk to each other
//! without any serialization boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::error::{FramelinkError, Result};
use crate::transport::{Emitter, Inbound, Strategy, MESSAGE_EVENT};

/// In-process strategy for same-context client/server wiring and tests.
pub struct LoopbackStrategy {
    emitter: Emitter,
    listening: AtomicBool,
    this: Weak<LoopbackStrategy>,
}

impl LoopbackStrategy {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| LoopbackStrategy {
            emitter: Emitter::new(),
            listening: AtomicBool::new(false),
            this: this.clone(),
        })
    }
}

#[async_trait]
impl Strategy for LoopbackStrategy {
    async fn publish(&self, message: Value) -> Result<()> {
        if !self.listening.load(Ordering::SeqCst) {
            return Err(FramelinkError::Transport(
                "loopback channel is not listening".to_string(),
            ));
        }
        let reply = self
            .this
            .upgrade()
            .map(|strategy| strategy as Arc<dyn Strategy>);
        self.emitter.emit(
            MESSAGE_EVENT,
            Inbound {
                data: message,
                origin: None,
                reply,
            },
        );
        Ok(())
    }

    async fn listen(&self) -> Result<()> {
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn emitter(&self) -> &Emitter {
        &self.emitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_requires_listen() {
        let strategy = LoopbackStrategy::new();
        let result = strategy.publish(json!({"type": "request"})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publish_reenters_as_inbound() {
        let strategy = LoopbackStrategy::new();
        strategy.listen().await.unwrap();
        let mut rx = strategy.emitter().on(MESSAGE_EVENT);
        strategy.publish(json!({"type": "request"})).await.unwrap();
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.data, json!({"type": "request"}));
        assert!(inbound.reply.is_some());
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let strategy = LoopbackStrategy::new();
        strategy.listen().await.unwrap();
        strategy.close().await.unwrap();
        assert!(strategy.publish(json!({})).await.is_err());
    }
}
