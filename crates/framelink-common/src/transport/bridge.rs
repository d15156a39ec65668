//! Bridge between two independent execution contexts.
//!
//! Endpoints register by name in a process-local [`MessageHub`]; a connecting
//! strategy lazily establishes the channel on its first publish, memoizes the
//! in-flight setup future in a long-TTL cache (concurrent first-publishers
//! share one setup) and requires an `online` handshake from the remote end
//! before the setup resolves. Handshake frames are transport-internal and
//! never surface as `"message"` events.
//!
//! Every inbound data frame carries the sender's channel handle, from which a
//! per-sender reply strategy is built, so the receiving side can answer
//! without a persistent reverse channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::TtlCache;
use crate::protocol::error::{FramelinkError, Result};
use crate::transport::{Emitter, Inbound, Strategy, MESSAGE_EVENT};

/// Field marking a frame as transport-internal.
const CONTROL_KEY: &str = "__bridge";

/// Event raised by an endpoint when a peer initiates its handshake.
pub const HANDSHAKE_EVENT: &str = "handshake";

/// Event raised by a connector when the remote end signals it is online.
pub const ONLINE_EVENT: &str = "online";

type FrameSender = mpsc::UnboundedSender<Frame>;
type SetupFuture = Shared<BoxFuture<'static, std::result::Result<FrameSender, String>>>;

/// A unit of transfer between two bridge sides.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The wire object being carried
    pub data: Value,
    /// Identity of the sending side, when it has one
    pub origin: Option<String>,
    /// Channel handle of the sender, for replies
    pub reply_to: Option<FrameSender>,
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<String, FrameSender>,
    waiters: HashMap<String, Vec<oneshot::Sender<FrameSender>>>,
}

/// Process-local registry of named bridge endpoints.
///
/// Stands in for whatever names execution contexts in the hosting
/// environment; connectors resolve endpoint names through it and block until
/// the endpoint appears (bounded by the handshake timeout).
#[derive(Clone, Default)]
pub struct MessageHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MessageHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint, waking every connector waiting for it.
    pub fn register(&self, name: &str, sender: FrameSender) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(waiters) = inner.waiters.remove(name) {
            for waiter in waiters {
                let _ = waiter.send(sender.clone());
            }
        }
        inner.endpoints.insert(name.to_string(), sender);
    }

    /// Removes an endpoint registration.
    pub fn unregister(&self, name: &str) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.endpoints.remove(name);
    }

    /// Channel handle of a registered endpoint.
    pub fn endpoint(&self, name: &str) -> Option<FrameSender> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        inner.endpoints.get(name).cloned()
    }

    async fn wait_for(&self, name: &str) -> std::result::Result<FrameSender, String> {
        let waiter = {
            let mut inner = self.inner.lock().expect("hub lock poisoned");
            if let Some(sender) = inner.endpoints.get(name) {
                return Ok(sender.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(name.to_string()).or_default().push(tx);
            rx
        };
        waiter
            .await
            .map_err(|_| format!("message hub dropped while waiting for '{name}'"))
    }
}

/// Bridge strategy tuning knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on endpoint resolution plus the online handshake
    pub handshake_timeout: Duration,
    /// How long an established channel setup stays memoized
    pub setup_ttl: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            handshake_timeout: Duration::from_secs(10),
            setup_ttl: Duration::from_secs(3600),
        }
    }
}

enum Role {
    /// Dials a named endpoint; replies come back on the own inbox.
    Connector { hub: MessageHub, url: String },
    /// Accepts connections under a registered name.
    Endpoint { hub: MessageHub, name: String },
    /// Bound to one remote inbox; used to answer a specific sender.
    Reply { peer: FrameSender },
}

/// Strategy bridging two execution contexts through a [`MessageHub`].
pub struct BridgeStrategy {
    role: Role,
    config: BridgeConfig,
    emitter: Emitter,
    inbox_tx: FrameSender,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    setup: TtlCache<SetupFuture>,
    online_tx: watch::Sender<bool>,
    online_rx: watch::Receiver<bool>,
    listening: AtomicBool,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
    this: Weak<BridgeStrategy>,
}

impl BridgeStrategy {
    /// A strategy dialing the endpoint registered under `url`.
    pub fn connect(hub: MessageHub, url: impl Into<String>) -> Arc<Self> {
        Self::connect_with_config(hub, url, BridgeConfig::default())
    }

    pub fn connect_with_config(
        hub: MessageHub,
        url: impl Into<String>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Self::build(
            Role::Connector {
                hub,
                url: url.into(),
            },
            config,
        )
    }

    /// A strategy accepting connections under `name`.
    pub fn endpoint(hub: MessageHub, name: impl Into<String>) -> Arc<Self> {
        Self::endpoint_with_config(hub, name, BridgeConfig::default())
    }

    pub fn endpoint_with_config(
        hub: MessageHub,
        name: impl Into<String>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Self::build(
            Role::Endpoint {
                hub,
                name: name.into(),
            },
            config,
        )
    }

    fn reply(peer: FrameSender) -> Arc<Self> {
        Self::build(Role::Reply { peer }, BridgeConfig::default())
    }

    fn build(role: Role, config: BridgeConfig) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = watch::channel(false);
        let setup_ttl = config.setup_ttl;
        Arc::new_cyclic(|this| BridgeStrategy {
            role,
            config,
            emitter: Emitter::new(),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            setup: TtlCache::new(setup_ttl),
            online_tx,
            online_rx,
            listening: AtomicBool::new(false),
            receive_loop: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// The memoized channel setup for `url`: resolve the endpoint, send the
    /// handshake and wait for the remote `online` signal. Concurrent callers
    /// share the same in-flight future.
    fn channel_setup(&self, hub: &MessageHub, url: &str) -> SetupFuture {
        let hub = hub.clone();
        let target = url.to_string();
        let inbox = self.inbox_tx.clone();
        let online = self.online_rx.clone();
        let timeout = self.config.handshake_timeout;
        self.setup.peek_or_insert_with(url, move || {
            async move {
                let handshake = async {
                    let remote = hub.wait_for(&target).await?;
                    remote
                        .send(Frame {
                            data: json!({ CONTROL_KEY: { "syn": true } }),
                            origin: None,
                            reply_to: Some(inbox),
                        })
                        .map_err(|_| format!("endpoint '{target}' is gone"))?;
                    let mut online = online;
                    online
                        .wait_for(|ready| *ready)
                        .await
                        .map_err(|_| "bridge closed during handshake".to_string())?;
                    Ok(remote)
                };
                match tokio::time::timeout(timeout, handshake).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("handshake with '{target}' timed out")),
                }
            }
            .boxed()
            .shared()
        })
    }
}

#[async_trait]
impl Strategy for BridgeStrategy {
    async fn publish(&self, message: Value) -> Result<()> {
        match &self.role {
            Role::Reply { peer } => peer
                .send(Frame {
                    data: message,
                    origin: None,
                    reply_to: None,
                })
                .map_err(|_| FramelinkError::Transport("reply channel is gone".to_string())),
            Role::Connector { hub, url } => {
                let setup = self.channel_setup(hub, url);
                let remote = match setup.await {
                    Ok(remote) => remote,
                    Err(error) => {
                        // Drop the failed setup so a later publish retries.
                        let _ = self.setup.get(url);
                        return Err(FramelinkError::Transport(error));
                    }
                };
                remote
                    .send(Frame {
                        data: message,
                        origin: None,
                        reply_to: Some(self.inbox_tx.clone()),
                    })
                    .map_err(|_| {
                        FramelinkError::Transport(format!("endpoint '{url}' is gone"))
                    })
            }
            Role::Endpoint { .. } => Err(FramelinkError::Transport(
                "endpoint strategies answer through reply channels".to_string(),
            )),
        }
    }

    async fn listen(&self) -> Result<()> {
        if matches!(self.role, Role::Reply { .. }) {
            return Ok(());
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let receiver = self.inbox_rx.lock().expect("bridge lock poisoned").take();
        let Some(mut receiver) = receiver else {
            // Closed once already; a bridge channel cannot reopen.
            return Ok(());
        };
        if let Role::Endpoint { hub, name } = &self.role {
            hub.register(name, self.inbox_tx.clone());
            debug!(endpoint = %name, "bridge endpoint registered");
        }
        let emitter = self.emitter.clone();
        let online_tx = self.online_tx.clone();
        let is_connector = matches!(self.role, Role::Connector { .. });
        let this = self.this.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                if let Some(control) = frame.data.get(CONTROL_KEY) {
                    if control.get("syn").and_then(Value::as_bool) == Some(true) {
                        emitter.emit(
                            HANDSHAKE_EVENT,
                            Inbound {
                                data: frame.data.clone(),
                                origin: frame.origin.clone(),
                                reply: None,
                            },
                        );
                        if let Some(reply_to) = &frame.reply_to {
                            let _ = reply_to.send(Frame {
                                data: json!({ CONTROL_KEY: { "online": true } }),
                                origin: None,
                                reply_to: None,
                            });
                        }
                    } else if control.get("online").and_then(Value::as_bool) == Some(true) {
                        debug!("remote endpoint is online");
                        let _ = online_tx.send(true);
                        emitter.emit(
                            ONLINE_EVENT,
                            Inbound {
                                data: frame.data,
                                origin: frame.origin,
                                reply: None,
                            },
                        );
                    }
                    continue;
                }
                // Connectors answer on their established channel; endpoints
                // answer the specific sender through its channel handle.
                let reply: Option<Arc<dyn Strategy>> = if is_connector {
                    this.upgrade().map(|strategy| strategy as Arc<dyn Strategy>)
                } else {
                    frame
                        .reply_to
                        .clone()
                        .map(|peer| BridgeStrategy::reply(peer) as Arc<dyn Strategy>)
                };
                emitter.emit(
                    MESSAGE_EVENT,
                    Inbound {
                        data: frame.data,
                        origin: frame.origin,
                        reply,
                    },
                );
            }
        });
        *self.receive_loop.lock().expect("bridge lock poisoned") = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if matches!(self.role, Role::Reply { .. }) {
            return Ok(());
        }
        if !self.listening.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Role::Endpoint { hub, name } = &self.role {
            hub.unregister(name);
        }
        if let Some(handle) = self
            .receive_loop
            .lock()
            .expect("bridge lock poisoned")
            .take()
        {
            handle.abort();
        }
        Ok(())
    }

    fn emitter(&self) -> &Emitter {
        &self.emitter
    }
}

impl Drop for BridgeStrategy {
    fn drop(&mut self) {
        if let Ok(mut receive_loop) = self.receive_loop.lock() {
            if let Some(handle) = receive_loop.take() {
                handle.abort();
            }
        }
    }
}
