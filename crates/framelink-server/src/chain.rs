//! Ordered middleware chain with explicit continuation.
//!
//! Handlers receive the request/response pair and a [`Next`] continuation.
//! Running the continuation advances to the next handler in registration
//! order; sending the response, or simply not continuing, halts the chain.
//! There is no implicit "unhandled" response: a chain that runs to completion
//! without any handler sending leaves the remote caller to time out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::error;

use framelink_common::{Request, Response};

/// A boxed handler future.
pub type HandlerFuture = BoxFuture<'static, ()>;

/// A chain entry: `(request, response, next)`.
pub type Handler = Arc<dyn Fn(Request, Response, Next) -> HandlerFuture + Send + Sync>;

/// The ordered handler list. Global middlewares and route-specific handlers
/// live in the same list, in registration order. Cloning shares the list.
#[derive(Clone, Default)]
pub struct Chain {
    handlers: Arc<Mutex<Vec<Handler>>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler.
    pub fn use_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.use_raw(Arc::new(move |req, res, next| handler(req, res, next).boxed()));
    }

    /// Appends an already-boxed handler.
    pub fn use_raw(&self, handler: Handler) {
        self.handlers.lock().expect("chain lock poisoned").push(handler);
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.lock().expect("chain lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the pair through the chain from the first handler.
    pub async fn handle(&self, request: Request, response: Response) {
        let snapshot: Arc<[Handler]> = self
            .handlers
            .lock()
            .expect("chain lock poisoned")
            .clone()
            .into();
        Next {
            handlers: snapshot,
            index: 0,
        }
        .run(request, response)
        .await;
    }

    /// Runs the chain on its own task, isolating handler panics: a panicking
    /// handler is logged and the interaction abandoned, leaving the remote
    /// caller to time out. Nothing is propagated back to the transport.
    pub fn dispatch(&self, request: Request, response: Response) {
        let chain = self.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(chain.handle(request, response))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                error!(
                    reason = panic_message(&panic),
                    "request handler panicked; interaction abandoned"
                );
            }
        });
    }
}

/// Continuation advancing the chain to its next handler.
pub struct Next {
    handlers: Arc<[Handler]>,
    index: usize,
}

impl Next {
    /// Invokes the next handler with the given pair; completes immediately
    /// when the chain is exhausted.
    pub fn run(self, request: Request, response: Response) -> HandlerFuture {
        async move {
            if let Some(handler) = self.handlers.get(self.index) {
                let handler = handler.clone();
                let next = Next {
                    handlers: Arc::clone(&self.handlers),
                    index: self.index + 1,
                };
                handler(request, response, next).await;
            }
        }
        .boxed()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_common::{Method, Request, Response};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pair() -> (Request, Response) {
        let request = Request::new(Method::Get, "/x");
        let response = Response::for_request(&request);
        (request, response)
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let chain = Chain::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            chain.use_handler(move |req, res, next| {
                order.lock().unwrap().push(tag);
                next.run(req, res)
            });
        }

        let (req, res) = pair();
        chain.handle(req, res).await;
        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_not_continuing_halts_the_chain() {
        let chain = Chain::new();
        let reached = Arc::new(AtomicUsize::new(0));

        chain.use_handler(|_req, _res, _next| async {});
        let counter = Arc::clone(&reached);
        chain.use_handler(move |_req, _res, _next| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        });

        let (req, res) = pair();
        chain.handle(req, res).await;
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_chain_completes_silently() {
        let chain = Chain::new();
        chain.use_handler(|req, res, next| next.run(req, res));
        let (req, res) = pair();
        chain.handle(req, res).await;
    }

    #[tokio::test]
    async fn test_dispatch_isolates_panics() {
        let chain = Chain::new();
        let after = Arc::new(AtomicUsize::new(0));

        chain.use_handler(|_req, _res, _next| async { panic!("handler fault") });

        let (req, res) = pair();
        chain.dispatch(req, res);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The dispatching side is still alive and can run another chain.
        let counter = Arc::clone(&after);
        let survivor = Chain::new();
        survivor.use_handler(move |_req, _res, _next| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        });
        let (req, res) = pair();
        survivor.handle(req, res).await;
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }
}
