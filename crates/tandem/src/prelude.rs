//! Common imports for tandem applications.
//!
//! ```rust,ignore
//! use tandem::prelude::*;
//! ```

pub use crate::assign::{Assigner, MapAssigner, ServiceMap};
pub use crate::client::{Client, ClientError, ClientOptions, Spec};
pub use crate::context::Context;
pub use crate::handler::{handler_fn, method, Handler};
pub use crate::server::{Server, ServerContext, ServerError, ServerOptions};
pub use tandem_channel::{Channel, Framing};
pub use tandem_wire::{Request, RequestId, Response, RpcError};
