//! # muxwire
//!
//! Multiplexed RPC wire engine.
//!
//! One byte stream carries any number of independent logical exchanges:
//! service lookups, request/reply pairs with chunked payloads, and
//! cancellations. Each connection authenticates once with a SASL-style
//! mechanism, then every request and reply is flow controlled per exchange.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): `u32` length, `u8` tag, body
//! - **Connection** ([`connection`]): read loop, writer task, swappable frame handler
//! - **Handshake** ([`handshake`], [`auth`]): GREETING exchange, then authentication
//! - **Steady state** ([`handler`], [`request`], [`stream`]): four correlation
//!   tables, request state machines, chunk relays
//!
//! ## Example
//!
//! ```ignore
//! use muxwire::{Endpoint, ReplyContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> muxwire::Result<()> {
//!     let server = Endpoint::builder()
//!         .service("echo", "*", |value: serde_json::Value, ctx: ReplyContext| async move {
//!             ctx.reply(&value).await
//!         })
//!         .build()?;
//!     let client = Endpoint::builder().build()?;
//!
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!     let (_served, connected) = tokio::join!(server.accept(a), client.connect(b));
//!
//!     let echo = connected?.open_service("echo", "default").await?;
//!     assert_eq!(echo.invoke(&json!("hi")).await?, json!("hi"));
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod buffer_pool;
pub mod close;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod flow_control;
pub mod handler;
pub mod handshake;
pub mod marshal;
pub mod protocol;
pub mod request;
pub mod stream;
pub mod writer;

pub use config::{ConnectionConfig, Side};
pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{MuxwireError, RemoteException, Result};
pub use handler::{
    ConnectionHandler, ExportedClient, RemoteClient, ReplyContext, RequestHandler,
    ServiceRegistry, ServiceResolver,
};
pub use marshal::Value;
pub use request::{PendingReply, RawReply};
