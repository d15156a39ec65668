//! The client façade: correlated requests over a transport strategy, plus
//! the reference-counted subscription layer and its keepalive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use framelink_common::cache::{PutOptions, TtlCache};
use framelink_common::{
    Event, FramelinkError, Kind, Method, Request, Response, Result, Strategy, MESSAGE_EVENT,
};

use crate::subscriptions::{EventCallback, RemoveOutcome, SubscribeAck, SubscriptionState};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default time budget for a request before it rejects with a timeout
    pub timeout: Duration,
    /// Cadence of the batched keepalive ping while resources are subscribed
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Request payload; an empty object when omitted
    pub data: Option<serde_json::Value>,
    /// Extra headers to stamp on the request
    pub headers: std::collections::HashMap<String, String>,
    /// Time budget override for this request
    pub timeout: Option<Duration>,
}

type Resolver = oneshot::Sender<Response>;

/// A Framelink client.
///
/// Every request is correlated to its response through the transaction
/// cache: the response either claims the parked resolver within the time
/// budget or the request rejects with [`FramelinkError::Timeout`]. A
/// response arriving after its deadline finds no resolver and is dropped.
pub struct Client {
    strategy: Arc<dyn Strategy>,
    cache: TtlCache<Resolver>,
    subscriptions: Arc<AsyncMutex<SubscriptionState>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
    closed: AtomicBool,
}

impl Client {
    /// Creates a client over the given strategy and starts listening on it.
    pub async fn new(strategy: Arc<dyn Strategy>) -> Result<Self> {
        Self::with_config(strategy, ClientConfig::default()).await
    }

    pub async fn with_config(strategy: Arc<dyn Strategy>, config: ClientConfig) -> Result<Self> {
        let cache = TtlCache::new(config.timeout);
        let subscriptions = Arc::new(AsyncMutex::new(SubscriptionState::default()));
        let inbound_rx = strategy.emitter().on(MESSAGE_EVENT);
        let receive_loop =
            spawn_receive_loop(inbound_rx, cache.clone(), Arc::clone(&subscriptions));
        strategy.listen().await?;
        Ok(Client {
            strategy,
            cache,
            subscriptions,
            keepalive: Mutex::new(None),
            receive_loop: Mutex::new(Some(receive_loop)),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Issues a request and awaits its correlated response.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions,
    ) -> Result<Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FramelinkError::Closed);
        }
        let mut request = Request::new(method, url);
        if let Some(data) = opts.data {
            request = request.with_payload(data);
        }
        for (key, value) in opts.headers {
            request.set_header(key, value);
        }
        let ttl = opts.timeout.unwrap_or(self.config.timeout);
        issue(&self.strategy, &self.cache, &request, ttl).await
    }

    /// Issues a `get` request.
    pub async fn get(&self, url: &str, opts: RequestOptions) -> Result<Response> {
        self.request(Method::Get, url, opts).await
    }

    /// Issues a `post` request.
    pub async fn post(&self, url: &str, opts: RequestOptions) -> Result<Response> {
        self.request(Method::Post, url, opts).await
    }

    /// Issues a `put` request.
    pub async fn put(&self, url: &str, opts: RequestOptions) -> Result<Response> {
        self.request(Method::Put, url, opts).await
    }

    /// Issues a `patch` request.
    pub async fn patch(&self, url: &str, opts: RequestOptions) -> Result<Response> {
        self.request(Method::Patch, url, opts).await
    }

    /// Issues a `head` request.
    pub async fn head(&self, url: &str, opts: RequestOptions) -> Result<Response> {
        self.request(Method::Head, url, opts).await
    }

    /// Issues a `delete` request.
    pub async fn delete(&self, url: &str, opts: RequestOptions) -> Result<Response> {
        self.request(Method::Delete, url, opts).await
    }

    /// Issues an `options` request.
    pub async fn options(&self, url: &str, opts: RequestOptions) -> Result<Response> {
        self.request(Method::Options, url, opts).await
    }

    /// Fetches the remote server's resource description.
    pub async fn describe(&self) -> Result<Response> {
        self.get("/description", RequestOptions::default()).await
    }

    /// Subscribes `callback` to events on `resource`.
    ///
    /// The first subscription for a resource performs the network subscribe
    /// and arms the keepalive; later ones only append locally under the
    /// shared subscription id.
    pub async fn subscribe(&self, resource: &str, callback: EventCallback) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FramelinkError::Closed);
        }
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.append_existing(resource, &callback) {
            return Ok(());
        }
        let response = self
            .request(Method::Subscribe, resource, RequestOptions::default())
            .await?;
        if response.code != 200 {
            return Err(FramelinkError::Subscription(format!(
                "subscribe to '{resource}' refused with status {}",
                response.code
            )));
        }
        let ack: SubscribeAck = serde_json::from_value(response.payload.clone())?;
        debug!(resource = %ack.resource, subscription = %ack.subscription_id, "subscribed");
        subscriptions.insert(resource, ack.subscription_id, callback);
        self.ensure_keepalive();
        Ok(())
    }

    /// Removes `callback` from `resource`.
    ///
    /// The network unsubscribe happens only when the last local callback for
    /// the resource is removed; a resource with no subscription at all is an
    /// error, never a silent no-op.
    pub async fn unsubscribe(&self, resource: &str, callback: &EventCallback) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FramelinkError::Closed);
        }
        let mut subscriptions = self.subscriptions.lock().await;
        match subscriptions.remove(resource, callback) {
            RemoveOutcome::NotSubscribed => Err(FramelinkError::Subscription(format!(
                "no subscribers associated with '{resource}'"
            ))),
            RemoveOutcome::Remaining => Ok(()),
            RemoveOutcome::Empty { subscription_id } => {
                let response = self
                    .request(
                        Method::Unsubscribe,
                        resource,
                        RequestOptions {
                            // Send both field conventions so either server
                            // generation resolves the subscription.
                            data: Some(json!({
                                "subscriptionId": subscription_id,
                                "id": subscription_id,
                            })),
                            ..RequestOptions::default()
                        },
                    )
                    .await?;
                if subscriptions.is_empty() {
                    self.stop_keepalive();
                }
                if response.code != 200 {
                    return Err(FramelinkError::Subscription(format!(
                        "unsubscribe from '{resource}' refused with status {}",
                        response.code
                    )));
                }
                Ok(())
            }
        }
    }

    /// Closes the client: cancels the keepalive, clears local subscription
    /// state and pending correlations, and closes the strategy. Server-side
    /// subscriptions are not torn down.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_keepalive();
        if let Some(handle) = self
            .receive_loop
            .lock()
            .expect("client lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.subscriptions.lock().await.clear();
        self.cache.clear();
        self.strategy.close().await
    }

    fn ensure_keepalive(&self) {
        let mut keepalive = self.keepalive.lock().expect("client lock poisoned");
        if keepalive.is_some() {
            return;
        }
        let strategy = Arc::clone(&self.strategy);
        let cache = self.cache.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        let period = self.config.keepalive_interval;
        let timeout = self.config.timeout;
        *keepalive = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first interval tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let resources = subscriptions.lock().await.resources();
                if resources.is_empty() {
                    continue;
                }
                let ping = Request::new(Method::Ping, "/")
                    .with_payload(json!({ "resources": resources }));
                if let Err(error) = issue(&strategy, &cache, &ping, timeout).await {
                    warn!(%error, "keepalive ping failed");
                }
            }
        }));
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().expect("client lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut keepalive) = self.keepalive.lock() {
            if let Some(handle) = keepalive.take() {
                handle.abort();
            }
        }
        if let Ok(mut receive_loop) = self.receive_loop.lock() {
            if let Some(handle) = receive_loop.take() {
                handle.abort();
            }
        }
    }
}

/// Parks a resolver for the request's transaction id, publishes the request
/// and awaits the correlated response within `ttl`.
async fn issue(
    strategy: &Arc<dyn Strategy>,
    cache: &TtlCache<Resolver>,
    request: &Request,
    ttl: Duration,
) -> Result<Response> {
    let (resolver, resolved) = oneshot::channel();
    cache.put(
        request.transaction_id.clone(),
        resolver,
        PutOptions {
            ttl: Some(ttl),
            on_expire: Some(Box::new(|transaction| {
                debug!(transaction, "request deadline elapsed");
            })),
        },
    );
    if let Err(error) = strategy.publish(request.serialize()).await {
        let _ = cache.get(&request.transaction_id);
        return Err(error);
    }
    match resolved.await {
        Ok(response) => Ok(response),
        // The deadline evicted the resolver (or the client closed) before a
        // response claimed it.
        Err(_) => Err(FramelinkError::Timeout(ttl.as_millis() as u64)),
    }
}

fn spawn_receive_loop(
    mut inbound_rx: broadcast::Receiver<framelink_common::Inbound>,
    cache: TtlCache<Resolver>,
    subscriptions: Arc<AsyncMutex<SubscriptionState>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match inbound_rx.recv().await {
                Ok(inbound) => match Kind::of(&inbound.data) {
                    Some(Kind::Response) => match Response::from_wire(inbound.data) {
                        Ok(response) => match cache.get(&response.transaction_id) {
                            Some(resolver) => {
                                let _ = resolver.send(response);
                            }
                            None => {
                                debug!(transaction = %response.transaction_id,
                                    "unmatched response dropped");
                            }
                        },
                        Err(error) => warn!(%error, "dropping malformed inbound response"),
                    },
                    Some(Kind::Event) => match Event::from_wire(inbound.data) {
                        Ok(event) => {
                            let callbacks =
                                subscriptions.lock().await.callbacks_for(&event.resource);
                            for callback in callbacks {
                                callback(event.clone());
                            }
                        }
                        Err(error) => warn!(%error, "dropping malformed inbound event"),
                    },
                    // Requests on a shared channel are the server's business.
                    _ => {}
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client receive loop lagged behind the strategy");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
