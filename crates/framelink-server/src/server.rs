//! The server façade: router + chain + subscription registry composed over a
//! transport strategy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use framelink_common::{Kind, Method, Request, Response, Result, Strategy, MESSAGE_EVENT};

use crate::chain::{Chain, Next};
use crate::router::{compile, ResourceRouter, RouteOptions};
use crate::subscriptions::{PublishReport, SubscriptionRegistry};

/// A Framelink server.
///
/// Two groups of handlers are installed at construction, ahead of anything
/// the user registers: the built-in `GET /description` route and the
/// subscription middleware that intercepts the reserved `subscribe`,
/// `unsubscribe` and `ping` verbs so they never reach user routing.
pub struct Server {
    router: Arc<Mutex<ResourceRouter>>,
    chain: Chain,
    subscriptions: SubscriptionRegistry,
    strategy: Arc<dyn Strategy>,
    listening: AtomicBool,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a server over the given strategy and installs the built-in
    /// handlers.
    pub fn new(strategy: Arc<dyn Strategy>) -> Self {
        let server = Server {
            router: Arc::new(Mutex::new(ResourceRouter::new())),
            chain: Chain::new(),
            subscriptions: SubscriptionRegistry::new(),
            strategy,
            listening: AtomicBool::new(false),
            receive_loop: Mutex::new(None),
        };
        server.install_builtins();
        server
    }

    fn install_builtins(&self) {
        let router = Arc::clone(&self.router);
        // The description route goes through the normal registration path so
        // it shows up in its own output.
        let registered = self.register(
            Method::Get,
            "/description",
            RouteOptions {
                description: Some("Describes the resources exposed by this server".to_string()),
            },
            move |_req, mut res, _next| {
                let description = router.lock().expect("router lock poisoned").describe();
                async move {
                    if let Err(error) = res.send(200, description).await {
                        warn!(%error, "failed to send description");
                    }
                }
            },
        );
        if let Err(error) = registered {
            warn!(%error, "failed to install description route");
        }

        let subscriptions = self.subscriptions.clone();
        self.chain.use_raw(Arc::new(move |req, res, next| {
            subscription_middleware(subscriptions.clone(), req, res, next)
        }));
    }

    /// Appends a global middleware. Middlewares run in registration order,
    /// after the built-ins.
    pub fn use_middleware<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.chain.use_handler(handler);
        self
    }

    /// Registers `handler` for `method` on the path template `pattern`.
    ///
    /// The pattern is compiled once here; at dispatch time the handler runs
    /// only when both the verb and the pattern match, with `params` populated
    /// from the pattern's named segments. On non-match the entry clears
    /// `params` and forwards to the next handler.
    pub fn register<F, Fut>(
        &self,
        method: Method,
        pattern: &str,
        opts: RouteOptions,
        handler: F,
    ) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (matcher, names) = compile(pattern)?;
        self.router
            .lock()
            .expect("router lock poisoned")
            .add(pattern, method.as_str(), opts)?;

        let handler = Arc::new(handler);
        let verb = method.as_str();
        self.chain.use_raw(Arc::new(move |mut req, res, next| {
            let captures = (req.method == verb)
                .then(|| matcher.captures(&req.resource))
                .flatten()
                .map(|found| {
                    found
                        .iter()
                        .skip(1)
                        .flatten()
                        .map(|capture| capture.as_str().to_string())
                        .collect::<Vec<_>>()
                });
            match captures {
                Some(values) => {
                    req.params = crate::router::bind_params(&names, &values);
                    handler(req, res, next).boxed()
                }
                None => {
                    req.params.clear();
                    next.run(req, res)
                }
            }
        }));
        Ok(self)
    }

    /// Registers a `get` handler.
    pub fn get<F, Fut>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(Method::Get, pattern, RouteOptions::default(), handler)
    }

    /// Registers a `post` handler.
    pub fn post<F, Fut>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(Method::Post, pattern, RouteOptions::default(), handler)
    }

    /// Registers a `put` handler.
    pub fn put<F, Fut>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(Method::Put, pattern, RouteOptions::default(), handler)
    }

    /// Registers a `patch` handler.
    pub fn patch<F, Fut>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(Method::Patch, pattern, RouteOptions::default(), handler)
    }

    /// Registers a `head` handler.
    pub fn head<F, Fut>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(Method::Head, pattern, RouteOptions::default(), handler)
    }

    /// Registers a `delete` handler.
    pub fn delete<F, Fut>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(Method::Delete, pattern, RouteOptions::default(), handler)
    }

    /// Registers an `options` handler.
    pub fn options<F, Fut>(&self, pattern: &str, handler: F) -> Result<&Self>
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.register(Method::Options, pattern, RouteOptions::default(), handler)
    }

    /// Publishes an event on `resource` to every current subscriber.
    pub async fn publish(&self, resource: &str, payload: Value) -> PublishReport {
        self.subscriptions.publish(resource, payload).await
    }

    /// Starts accepting requests from the strategy. Idempotent.
    ///
    /// Each inbound request is reconstructed and pushed through the chain on
    /// its own task; reconstruction failures are logged and dropped, never
    /// surfaced to the transport.
    pub async fn listen(&self) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inbound_rx = self.strategy.emitter().on(MESSAGE_EVENT);
        let chain = self.chain.clone();
        let handle = tokio::spawn(async move {
            loop {
                match inbound_rx.recv().await {
                    Ok(inbound) => {
                        if Kind::of(&inbound.data) != Some(Kind::Request) {
                            continue;
                        }
                        match Request::from_inbound(inbound) {
                            Ok(request) => {
                                let response = Response::for_request(&request);
                                chain.dispatch(request, response);
                            }
                            Err(error) => {
                                warn!(%error, "dropping malformed inbound request");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "server receive loop lagged behind the strategy");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.receive_loop.lock().expect("server lock poisoned") = Some(handle);
        self.strategy.listen().await
    }

    /// Stops accepting requests. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self
            .receive_loop
            .lock()
            .expect("server lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.strategy.close().await
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Ok(mut receive_loop) = self.receive_loop.lock() {
            if let Some(handle) = receive_loop.take() {
                handle.abort();
            }
        }
    }
}

/// Intercepts the reserved verbs ahead of user routing.
fn subscription_middleware(
    subscriptions: SubscriptionRegistry,
    req: Request,
    mut res: Response,
    next: Next,
) -> crate::chain::HandlerFuture {
    let method = req.method.clone();
    match method.as_str() {
        "subscribe" => async move {
            let Some(reply) = req.reply_strategy().cloned() else {
                warn!(resource = %req.resource, "subscribe request without a reply channel");
                return;
            };
            let id = subscriptions.subscribe(&req.resource, reply);
            let ack = json!({ "resource": req.resource, "subscriptionId": id });
            if let Err(error) = res.send(200, ack).await {
                warn!(%error, "failed to acknowledge subscription");
            }
        }
        .boxed(),
        "unsubscribe" => async move {
            // Both the canonical and the legacy payload field name resolve.
            let id = req
                .payload
                .get("subscriptionId")
                .or_else(|| req.payload.get("id"))
                .and_then(Value::as_str);
            let outcome = match id {
                Some(id) if subscriptions.unsubscribe(&req.resource, id) => res
                    .send(200, json!({ "resource": req.resource, "subscriptionId": id }))
                    .await,
                _ => res.send(404, json!({ "error": "No such subscription" })).await,
            };
            if let Err(error) = outcome {
                warn!(%error, "failed to answer unsubscription");
            }
        }
        .boxed(),
        "ping" => async move {
            debug!(payload = %req.payload, "keepalive ping");
            if let Err(error) = res.send(200, json!({})).await {
                warn!(%error, "failed to answer ping");
            }
        }
        .boxed(),
        _ => next.run(req, res),
    }
}
