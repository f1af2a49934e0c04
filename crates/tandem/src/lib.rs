//! # tandem
//!
//! A symmetric JSON-RPC 2.0 client/server pair exchanging framed JSON
//! records over any bidirectional byte stream.
//!
//! ## Features
//!
//! - **Server dispatch engine**: concurrent handler execution under a
//!   bounded worker budget, request-ordered batch replies, cooperative
//!   cancellation via the `rpc.cancel` extension, and optional
//!   server-initiated notifications ("pushes").
//! - **Client multiplexer**: arbitrarily many in-flight calls, batches,
//!   push callbacks, and cancellation propagated to the server before the
//!   caller observes it.
//! - **Framed channels**: line, LSP, varint, and self-delimiting JSON
//!   framings over anything `AsyncRead + AsyncWrite` (see `tandem-channel`).
//! - **Typed handlers without reflection**: serde-backed adapters turn
//!   `async fn(ctx, P) -> Result<R, RpcError>` into dispatchable methods.
//!
//! ## Server
//!
//! ```rust,ignore
//! use tandem::{method, Framing, MapAssigner, Server, ServerOptions};
//!
//! let assigner = MapAssigner::new().with(
//!     "Add",
//!     method(|_ctx, values: Vec<i64>| async move { Ok(values.iter().sum::<i64>()) }),
//! );
//! let server = Server::new(assigner, ServerOptions::default());
//! server.start(Framing::Line.channel(reader, writer));
//! server.wait().await?;
//! ```
//!
//! ## Client
//!
//! ```rust,ignore
//! use tandem::{Client, ClientOptions, Context, Framing};
//!
//! let client = Client::new(Framing::Line.channel(reader, writer), ClientOptions::default());
//! let ctx = Context::new();
//! let sum: i64 = client.call(&ctx, "Add", Some(json!([1, 2, 3]))).await?.decode()?;
//! ```

pub mod assign;
pub mod client;
pub mod context;
pub mod handler;
pub mod jctx;
pub mod metrics;
pub mod prelude;
pub mod serve;
pub mod server;

pub use assign::{Assigner, MapAssigner, ServiceMap};
pub use client::{Client, ClientError, ClientOptions, EncodeContext, NotifyCallback, Spec};
pub use context::{Context, DoneReason};
pub use handler::{handler_fn, method, BoxHandler, Handler};
pub use metrics::Metrics;
pub use serve::{serve, LoopOptions};
pub use server::{DecodeContext, Server, ServerContext, ServerError, ServerInfo, ServerOptions};

// The wire model and channel framings are part of the public surface.
pub use tandem_channel::{Channel, Framing};
pub use tandem_wire::{ErrorCode, Request, RequestId, Response, RpcError};
