//! Endpoint builder and connection setup.
//!
//! The [`EndpointBuilder`] collects services, mechanisms, marshalling and
//! connection options. The resulting [`Endpoint`] turns byte streams into
//! authenticated connections:
//! 1. Start the framed connection with a handshake as its frame handler
//! 2. Exchange GREETINGs
//! 3. Authenticate
//! 4. Install the [`ConnectionHandler`] and hand it to the caller
//!
//! # Example
//!
//! ```ignore
//! use muxwire::{Endpoint, ReplyContext};
//! use serde_json::json;
//!
//! let server = Endpoint::builder()
//!     .service("math", "*", |args: (i64, i64), ctx: ReplyContext| async move {
//!         ctx.reply(&json!(args.0 + args.1)).await
//!     })
//!     .build()?;
//! let client = Endpoint::builder().build()?;
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let (served, connected) = tokio::join!(server.accept(a), client.connect(b));
//! let math = connected?.open_service("math", "default").await?;
//! assert_eq!(math.invoke(&json!([2, 3])).await?, json!(5));
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::debug;

use crate::auth::{Anonymous, MechanismProvider, MechanismRegistry};
use crate::config::{ConnectionConfig, Side};
use crate::connection::Connection;
use crate::error::{MuxwireError, Result};
use crate::handler::{
    ConnectionHandler, HandlerFactory, ReplyContext, RequestHandler, ServiceRegistry,
    ServiceResolver,
};
use crate::handshake::{ClientHandshake, HandshakeContext, HandshakeResult, ServerHandshake};
use crate::marshal::{MarshallerFactory, StandardMarshalling};

/// Builder for an [`Endpoint`].
///
/// Without any registered mechanism the endpoint uses `ANONYMOUS`.
pub struct EndpointBuilder {
    services: ServiceRegistry,
    resolver: Option<Arc<dyn ServiceResolver>>,
    marshalling: Arc<dyn MarshallerFactory>,
    mechanisms: MechanismRegistry,
    config: ConnectionConfig,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self {
            services: ServiceRegistry::new(),
            resolver: None,
            marshalling: Arc::new(StandardMarshalling::new()),
            mechanisms: MechanismRegistry::new(),
            config: ConnectionConfig::default(),
        }
    }

    /// Register a closure handler for `(service_type, group_name)`.
    ///
    /// The handler receives the request deserialized as `T`. Use
    /// [`ANY_GROUP`](crate::handler::ANY_GROUP) to serve every group.
    pub fn service<F, T, Fut>(mut self, service_type: &str, group_name: &str, handler: F) -> Self
    where
        F: Fn(T, ReplyContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.services.register(service_type, group_name, handler);
        self
    }

    /// Register one handler shared by every client of the service.
    pub fn service_handler(
        mut self,
        service_type: &str,
        group_name: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        self.services
            .register_handler(service_type, group_name, handler);
        self
    }

    /// Register a factory building a fresh handler per opened client.
    pub fn service_factory(
        mut self,
        service_type: &str,
        group_name: &str,
        factory: HandlerFactory,
    ) -> Self {
        self.services
            .register_factory(service_type, group_name, factory);
        self
    }

    /// Resolve services through `resolver` instead of the registered ones.
    pub fn resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the marshaller factory.
    ///
    /// Default: [`StandardMarshalling`] (JSON and MessagePack)
    pub fn marshalling(mut self, marshalling: Arc<dyn MarshallerFactory>) -> Self {
        self.marshalling = marshalling;
        self
    }

    /// Register an authentication mechanism.
    pub fn mechanism<M: MechanismProvider>(mut self, mechanism: M) -> Self {
        self.mechanisms.register(Arc::new(mechanism));
        self
    }

    /// Mechanism names in preference order (client) or the subset to
    /// offer (server).
    pub fn mechanism_order<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.mechanisms = names.into_iter().map(Into::into).collect();
        self
    }

    /// Replace every connection option at once.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Name sent to the peer in the GREETING.
    pub fn endpoint_name(mut self, name: &str) -> Self {
        self.config.endpoint_name = Some(name.to_string());
        self
    }

    /// Set the unacknowledged chunk window per request.
    ///
    /// Default: 5
    pub fn window_size(mut self, window: usize) -> Self {
        self.config.window_size = window;
        self
    }

    /// Set the send buffer size, which bounds each chunk.
    ///
    /// Default: 4096
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the maximum number of inbound requests executing at once.
    ///
    /// Default: 256
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.config.max_concurrent_requests = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.write_channel_capacity = capacity;
        self
    }

    /// Validate the options and build the endpoint.
    pub fn build(self) -> Result<Endpoint> {
        self.config.validate()?;
        if self.marshalling.versions().is_empty() {
            return Err(MuxwireError::Marshalling(
                "marshaller factory supports no versions".to_string(),
            ));
        }
        let mut mechanisms = self.mechanisms;
        if mechanisms.is_empty() {
            mechanisms.register(Arc::new(Anonymous::new()));
        }
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(self.services) as Arc<dyn ServiceResolver>);
        Ok(Endpoint {
            ctx: HandshakeContext {
                config: Arc::new(self.config),
                marshalling: self.marshalling,
                resolver,
                mechanisms,
            },
        })
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configured endpoint. Cheap to clone; one endpoint can run any number of
/// connections.
#[derive(Clone)]
pub struct Endpoint {
    ctx: HandshakeContext,
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.ctx.config
    }

    /// Registered mechanism names.
    pub fn mechanisms(&self) -> Vec<String> {
        self.ctx.mechanisms.names()
    }

    /// Run the connecting side of the handshake over `stream`.
    pub async fn connect<S>(&self, stream: S) -> Result<Arc<ConnectionHandler>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handshake = Arc::new(ClientHandshake::new(self.ctx.clone(), tx));
        let connection = Connection::start(
            stream,
            Side::Client,
            self.ctx.config.clone(),
            handshake.clone(),
        );
        if let Err(e) = handshake.send_greeting(&connection).await {
            handshake.abort(e);
            connection.close();
        }
        finish(rx).await
    }

    /// Run the accepting side of the handshake over `stream`.
    pub async fn accept<S>(&self, stream: S) -> Result<Arc<ConnectionHandler>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handshake = Arc::new(ServerHandshake::new(self.ctx.clone(), tx));
        Connection::start(stream, Side::Server, self.ctx.config.clone(), handshake);
        finish(rx).await
    }
}

async fn finish(rx: oneshot::Receiver<HandshakeResult>) -> Result<Arc<ConnectionHandler>> {
    let handler = rx.await.unwrap_or(Err(MuxwireError::ConnectionClosed))?;
    debug!(
        side = ?handler.side(),
        peer = ?handler.negotiated().peer_name,
        mechanism = %handler.negotiated().mechanism,
        "Connection established"
    );
    Ok(handler)
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.ctx.config)
            .field("mechanisms", &self.ctx.mechanisms)
            .field("marshallers", &self.ctx.marshalling.versions())
            .finish()
    }
}
