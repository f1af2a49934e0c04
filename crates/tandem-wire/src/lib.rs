//! # JSON-RPC 2.0 Wire Envelope
//!
//! The message model shared by the tandem client and server engines. This
//! crate knows nothing about transports or dispatch; it models requests,
//! notifications, responses and batches, and converts between those and raw
//! JSON records.
//!
//! Parsing is split by direction:
//! - [`parse_inbound`] interprets a record arriving at a server (requests and
//!   batches of requests), classifying failures as parse errors or invalid
//!   requests per the JSON-RPC 2.0 specification.
//! - [`parse_replies`] interprets a record arriving at a client (responses,
//!   batches of responses, and server-initiated pushes).
//!
//! Rendering omits absent `id`/`params`/`result` fields entirely rather than
//! emitting `null`, except for the error-reply case where a `null` id is
//! mandated.

pub mod envelope;
pub mod error;
pub mod request;
pub mod response;
pub mod types;

pub use envelope::{parse_inbound, parse_replies, EnvelopeError, Inbound, Reply};
pub use error::{ErrorCode, RpcError};
pub use request::Request;
pub use response::Response;
pub use types::{RequestId, Version};

/// JSON-RPC 2.0 version marker value.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes, plus the local extensions understood
/// by tandem peers.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Server error range reserved for user-defined errors.
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;

    /// Local extension: the call was cancelled via an `rpc.cancel`
    /// notification before the handler produced a result.
    pub const CANCELLED: i64 = -32001;
}
