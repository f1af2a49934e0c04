//! The context-metadata envelope.
//!
//! When installed via [`ClientOptions::encode_context`](crate::ClientOptions)
//! and [`ServerOptions::decode_context`](crate::ServerOptions), the caller's
//! deadline and metadata travel inside the request params:
//!
//! ```json
//! {"jctx": "1", "deadline": "2026-01-02T15:04:05.999999999Z", "meta": {...}, "payload": [1, 2]}
//! ```
//!
//! The decoder passes non-envelope params through untouched, so a server
//! with the hook installed still interoperates with clients that do not
//! wrap their params. Without the hooks the engines treat the envelope as
//! any other opaque params value.

use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tandem_wire::{request::params_are_structured, RpcError};

use crate::client::EncodeContext;
use crate::context::Context;
use crate::server::DecodeContext;

/// Version marker carried in the `jctx` field.
pub const VERSION: &str = "1";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    jctx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deadline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Wrap params in an envelope carrying the context's deadline and metadata.
/// A context with neither leaves the params untouched.
pub fn encode(ctx: &Context, params: Option<Value>) -> Result<Option<Value>, RpcError> {
    if ctx.deadline().is_none() && ctx.meta().is_none() {
        return Ok(params);
    }
    let envelope = Envelope {
        jctx: VERSION.to_string(),
        deadline: ctx
            .deadline()
            .map(|at| DateTime::<Utc>::from(at).to_rfc3339_opts(SecondsFormat::Nanos, true)),
        meta: ctx.meta().cloned(),
        payload: params,
    };
    let value = serde_json::to_value(envelope)
        .map_err(|e| RpcError::internal_error(e.to_string()))?;
    Ok(Some(value))
}

/// Unwrap an envelope, restoring the deadline and metadata onto the
/// request's context. Params that are not an envelope pass through.
pub fn decode(ctx: Context, params: Option<Value>) -> Result<(Context, Option<Value>), RpcError> {
    let is_envelope = matches!(
        &params,
        Some(Value::Object(obj)) if obj.get("jctx").and_then(Value::as_str) == Some(VERSION)
    );
    if !is_envelope {
        return Ok((ctx, params));
    }
    let Some(params) = params else {
        return Ok((ctx, None));
    };

    let envelope: Envelope = serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(format!("malformed context envelope: {e}")))?;

    let mut ctx = ctx;
    if let Some(deadline) = envelope.deadline {
        let at = DateTime::parse_from_rfc3339(&deadline)
            .map_err(|e| RpcError::invalid_params(format!("malformed deadline: {e}")))?;
        ctx = ctx.with_deadline(SystemTime::from(at));
    }
    if let Some(meta) = envelope.meta {
        ctx = ctx.with_meta(meta);
    }
    if let Some(payload) = &envelope.payload {
        if !params_are_structured(payload) {
            return Err(RpcError::invalid_params("payload is not an object or array"));
        }
    }
    Ok((ctx, envelope.payload))
}

/// The encoder as a client option value.
pub fn encode_context() -> EncodeContext {
    Arc::new(encode)
}

/// The decoder as a server option value.
pub fn decode_context() -> DecodeContext {
    Arc::new(decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn plain_context_passes_params_through() {
        let ctx = Context::new();
        let params = Some(json!([1, 2, 3]));
        assert_eq!(encode(&ctx, params.clone()).unwrap(), params);
    }

    #[test]
    fn roundtrip_restores_deadline_and_meta() {
        let deadline = SystemTime::now() + Duration::from_secs(30);
        let ctx = Context::new()
            .with_deadline(deadline)
            .with_meta(json!({"user": "a"}));

        let encoded = encode(&ctx, Some(json!([1, 2]))).unwrap().unwrap();
        assert_eq!(encoded["jctx"], json!("1"));

        let (decoded_ctx, payload) = decode(Context::new(), Some(encoded)).unwrap();
        assert_eq!(payload, Some(json!([1, 2])));
        assert_eq!(decoded_ctx.meta(), Some(&json!({"user": "a"})));

        // RFC3339 nanosecond rendering preserves the instant.
        let restored = decoded_ctx.deadline().unwrap();
        let skew = restored
            .duration_since(deadline)
            .unwrap_or_else(|e| e.duration());
        assert!(skew < Duration::from_micros(1));
    }

    #[test]
    fn non_envelope_params_pass_through_decode() {
        let params = Some(json!({"x": 1}));
        let (_, payload) = decode(Context::new(), params.clone()).unwrap();
        assert_eq!(payload, params);
    }

    #[test]
    fn envelope_without_payload_decodes_to_absent_params() {
        let ctx = Context::new().with_meta(json!("m"));
        let encoded = encode(&ctx, None).unwrap();
        let (decoded_ctx, payload) = decode(Context::new(), encoded).unwrap();
        assert_eq!(payload, None);
        assert_eq!(decoded_ctx.meta(), Some(&json!("m")));
    }

    #[test]
    fn malformed_deadline_is_invalid_params() {
        let params = json!({"jctx": "1", "deadline": "yesterday"});
        let err = decode(Context::new(), Some(params)).unwrap_err();
        assert_eq!(err.code, tandem_wire::error_codes::INVALID_PARAMS);
    }

    #[test]
    fn scalar_payload_is_invalid_params() {
        let params = json!({"jctx": "1", "payload": 7});
        let err = decode(Context::new(), Some(params)).unwrap_err();
        assert_eq!(err.code, tandem_wire::error_codes::INVALID_PARAMS);
    }
}
