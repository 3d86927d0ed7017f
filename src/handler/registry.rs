//! Local request handlers and the services that expose them.
//!
//! A [`RequestHandler`] receives every request sent to one client id. The
//! [`ServiceRegistry`] maps `(service type, group)` pairs to handler
//! factories and answers SERVICE_REQUEST lookups.
//!
//! # Example
//!
//! ```
//! use muxwire::handler::{ReplyContext, ServiceRegistry};
//! use serde_json::Value;
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register("echo", "*", |value: Value, ctx: ReplyContext| async move {
//!     ctx.reply(&value).await
//! });
//! assert!(registry.contains("echo", "default"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::ReplyContext;
use crate::error::{RemoteException, Result};
use crate::marshal::Value;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Group name that matches any requested group.
pub const ANY_GROUP: &str = "*";

/// Receives requests addressed to one client.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// The reply is sent through `reply`. Dropping it without replying
    /// answers the peer with a `NoReply` exception.
    fn receive_request(&self, request: Value, reply: ReplyContext) -> BoxFuture<'static, ()>;

    /// The client this handler serves was closed.
    fn close(&self) {}
}

/// Handler built from a closure over a deserialized argument.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, ReplyContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, ReplyContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> RequestHandler for TypedHandler<F, T, Fut>
where
    F: Fn(T, ReplyContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn receive_request(&self, request: Value, reply: ReplyContext) -> BoxFuture<'static, ()> {
        let parsed: T = match serde_json::from_value(request) {
            Ok(v) => v,
            Err(e) => {
                return Box::pin(async move {
                    let exception = RemoteException::new("InvalidArgument", e.to_string());
                    if let Err(e) = reply.reply_exception(exception).await {
                        debug!(error = %e, "Could not reject malformed request");
                    }
                })
            }
        };

        let request_id = reply.request_id();
        let fut = (self.handler)(parsed, reply);
        Box::pin(async move {
            if let Err(e) = fut.await {
                warn!(id = request_id, error = %e, "Request handler failed");
            }
        })
    }
}

/// Produces the handler for a newly opened client.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn RequestHandler> + Send + Sync>;

/// Finds the handler for a SERVICE_REQUEST.
pub trait ServiceResolver: Send + Sync + 'static {
    /// Handler for a new client of `(service_type, group_name)`, or `None`
    /// if no such service exists.
    fn resolve(&self, service_type: &str, group_name: &str) -> Option<Arc<dyn RequestHandler>>;
}

/// In-memory service directory.
///
/// Lookups try the exact `(type, group)` pair first, then `(type, "*")`.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<(String, String), HandlerFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure handler shared by every client of the service.
    pub fn register<F, T, Fut>(&mut self, service_type: &str, group_name: &str, handler: F)
    where
        F: Fn(T, ReplyContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Arc<dyn RequestHandler> = Arc::new(TypedHandler::new(handler));
        self.register_handler(service_type, group_name, handler);
    }

    /// Register one handler instance shared by every client of the service.
    pub fn register_handler(
        &mut self,
        service_type: &str,
        group_name: &str,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.register_factory(service_type, group_name, Arc::new(move || handler.clone()));
    }

    /// Register a factory that builds a fresh handler per client.
    pub fn register_factory(
        &mut self,
        service_type: &str,
        group_name: &str,
        factory: HandlerFactory,
    ) {
        self.services
            .insert((service_type.to_string(), group_name.to_string()), factory);
    }

    pub fn contains(&self, service_type: &str, group_name: &str) -> bool {
        self.lookup(service_type, group_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn lookup(&self, service_type: &str, group_name: &str) -> Option<&HandlerFactory> {
        self.services
            .get(&(service_type.to_string(), group_name.to_string()))
            .or_else(|| {
                self.services
                    .get(&(service_type.to_string(), ANY_GROUP.to_string()))
            })
    }
}

impl ServiceResolver for ServiceRegistry {
    fn resolve(&self, service_type: &str, group_name: &str) -> Option<Arc<dyn RequestHandler>> {
        self.lookup(service_type, group_name).map(|factory| factory())
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.services.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl RequestHandler for Counting {
        fn receive_request(&self, _request: Value, _reply: ReplyContext) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }

        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_exact_group_wins() {
        let exact = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        registry.register_handler("svc", "*", Arc::new(Counting(any.clone())));
        registry.register_handler("svc", "blue", Arc::new(Counting(exact.clone())));

        registry.resolve("svc", "blue").unwrap().close();
        registry.resolve("svc", "green").unwrap().close();

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(any.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_service() {
        let mut registry = ServiceRegistry::new();
        registry.register("echo", "default", |_: Value, _ctx: ReplyContext| async { Ok(()) });

        assert!(registry.resolve("echo", "default").is_some());
        assert!(registry.resolve("echo", "other").is_none());
        assert!(registry.resolve("missing", "default").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_factory_per_client() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = ServiceRegistry::new();
        let counter = built.clone();
        registry.register_factory(
            "svc",
            "*",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(Counting(Arc::new(AtomicUsize::new(0)))) as Arc<dyn RequestHandler>
            }),
        );

        registry.resolve("svc", "a");
        registry.resolve("svc", "b");
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }
}
