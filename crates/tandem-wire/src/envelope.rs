use std::collections::HashSet;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::RpcError;
use crate::request::{params_are_structured, Request};
use crate::response::Response;
use crate::types::RequestId;
use crate::JSONRPC_VERSION;

/// A record-level envelope failure: the whole record is answered with a
/// single null-id error reply.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvelopeError {
    /// The record is not well-formed JSON (-32700).
    #[error("parse error: {0}")]
    Parse(String),
    /// The record is JSON but violates the envelope structure (-32600).
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl EnvelopeError {
    /// The canonical wire error for this failure. The detail stays local
    /// (logs); the peer sees only the standard message.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            EnvelopeError::Parse(_) => RpcError::parse_error(),
            EnvelopeError::Invalid(_) => RpcError::invalid_request(),
        }
    }
}

/// One parsed inbound record: a batch flag and its members in request order.
///
/// Structurally invalid members surface as `Err` items so the server can
/// answer them in place without abandoning their siblings.
#[derive(Debug)]
pub struct Inbound {
    pub items: Vec<Result<Request, RpcError>>,
    pub batch: bool,
}

impl Inbound {
    /// The number of members that will produce a response: calls plus
    /// invalid members. Valid notifications are silent.
    pub fn reply_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| match item {
                Ok(req) => !req.is_notification(),
                Err(_) => true,
            })
            .count()
    }
}

/// Parse a record arriving at a server into requests.
///
/// Record-level failures (malformed JSON, an empty batch, a non-object
/// non-array top level, or duplicate call ids within one batch) are reported
/// as [`EnvelopeError`]; per-member structural violations become `Err` items
/// inside the batch.
pub fn parse_inbound(data: &[u8], allow_v1: bool) -> Result<Inbound, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| EnvelopeError::Parse(e.to_string()))?;

    let (members, batch) = match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(EnvelopeError::Invalid("empty batch".into()));
            }
            (items, true)
        }
        v @ Value::Object(_) => (vec![v], false),
        _ => {
            return Err(EnvelopeError::Invalid(
                "request is neither an object nor an array".into(),
            ))
        }
    };

    let items: Vec<Result<Request, RpcError>> = members
        .into_iter()
        .map(|member| parse_request_value(member, allow_v1))
        .collect();

    if batch {
        let mut seen = HashSet::new();
        for id in items
            .iter()
            .filter_map(|item| item.as_ref().ok())
            .filter_map(|req| req.id.as_ref())
        {
            if !seen.insert(id) {
                return Err(EnvelopeError::Invalid(format!(
                    "duplicate request id {id} in batch"
                )));
            }
        }
    }

    Ok(Inbound { items, batch })
}

fn parse_request_value(value: Value, allow_v1: bool) -> Result<Request, RpcError> {
    let Value::Object(mut obj) = value else {
        return Err(invalid("request is not an object"));
    };

    check_version(&mut obj, allow_v1).map_err(invalid)?;

    let method = match obj.remove("method") {
        Some(Value::String(name)) if !name.is_empty() => name,
        Some(Value::String(_)) => return Err(invalid("empty method name")),
        Some(_) => return Err(invalid("method is not a string")),
        None => return Err(invalid("missing method")),
    };

    let id = parse_id(obj.remove("id")).map_err(invalid)?;

    let params = match obj.remove("params") {
        None => None,
        Some(p) if params_are_structured(&p) => Some(p),
        Some(_) => return Err(invalid("params are not an object or array")),
    };

    Ok(Request { id, method, params })
}

/// One parsed item from a record arriving at a client.
#[derive(Debug)]
pub enum Reply {
    /// A response to one of our calls (or a null-id envelope error).
    Response(Response),
    /// A server-initiated notification: a method without an id.
    Push(Request),
}

/// Parse a record arriving at a client into responses and pushes.
///
/// Only whole-record JSON failures abort the parse; a structurally invalid
/// member becomes an `Err` item so the reader can log and skip it without
/// losing its siblings.
pub fn parse_replies(
    data: &[u8],
    allow_v1: bool,
) -> Result<Vec<Result<Reply, EnvelopeError>>, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| EnvelopeError::Parse(e.to_string()))?;

    let members = match value {
        Value::Array(items) => items,
        v @ Value::Object(_) => vec![v],
        _ => {
            return Err(EnvelopeError::Invalid(
                "response is neither an object nor an array".into(),
            ))
        }
    };

    Ok(members
        .into_iter()
        .map(|member| parse_reply_value(member, allow_v1))
        .collect())
}

fn parse_reply_value(value: Value, allow_v1: bool) -> Result<Reply, EnvelopeError> {
    let Value::Object(mut obj) = value else {
        return Err(EnvelopeError::Invalid("response is not an object".into()));
    };

    check_version(&mut obj, allow_v1).map_err(|d| EnvelopeError::Invalid(d.into()))?;

    let id = parse_id(obj.remove("id")).map_err(|d| EnvelopeError::Invalid(d.into()))?;

    // A member with a method and no id is a server push.
    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(EnvelopeError::Invalid("method is not a string".into()));
        };
        if id.is_some() {
            return Err(EnvelopeError::Invalid(
                "server request carries an id".into(),
            ));
        }
        return Ok(Reply::Push(Request {
            id: None,
            method,
            params: obj.remove("params"),
        }));
    }

    let result = obj.remove("result");
    let error = obj.remove("error");
    let payload = match (result, error) {
        (Some(result), None) => Ok(result),
        (None, Some(error)) => Err(serde_json::from_value::<RpcError>(error)
            .map_err(|e| EnvelopeError::Invalid(format!("malformed error object: {e}")))?),
        (Some(_), Some(_)) => {
            return Err(EnvelopeError::Invalid(
                "response carries both result and error".into(),
            ))
        }
        (None, None) => {
            return Err(EnvelopeError::Invalid(
                "response carries neither result nor error".into(),
            ))
        }
    };

    Ok(Reply::Response(Response { id, payload }))
}

fn check_version(obj: &mut Map<String, Value>, allow_v1: bool) -> Result<(), &'static str> {
    match obj.remove("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => Ok(()),
        Some(_) => Err("invalid version marker"),
        None if allow_v1 => Ok(()),
        None => Err("missing version marker"),
    }
}

// A null id is tolerated and treated as absent, matching the original
// implementation; anything else non-conforming is rejected.
fn parse_id(id: Option<Value>) -> Result<Option<RequestId>, &'static str> {
    match id {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(RequestId::String(s))),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) => Ok(Some(RequestId::Number(n))),
            None => Err("id is not an integer"),
        },
        Some(_) => Err("id is not a string or number"),
    }
}

fn invalid(detail: &str) -> RpcError {
    RpcError::invalid_request().with_data(Value::String(detail.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[test]
    fn single_call_parses() {
        let rec = bytes(json!({"jsonrpc": "2.0", "id": 1, "method": "Add", "params": [1, 2, 3]}));
        let inbound = parse_inbound(&rec, false).unwrap();
        assert!(!inbound.batch);
        let req = inbound.items[0].as_ref().unwrap();
        assert_eq!(req.id, Some(RequestId::Number(1)));
        assert_eq!(req.method, "Add");
        assert_eq!(req.params, Some(json!([1, 2, 3])));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_inbound(b"not json", false).unwrap_err();
        assert!(matches!(err, EnvelopeError::Parse(_)));
        assert_eq!(err.to_rpc_error().code, -32700);
    }

    #[test]
    fn empty_batch_is_invalid() {
        let err = parse_inbound(b"[]", false).unwrap_err();
        assert!(matches!(err, EnvelopeError::Invalid(_)));
        assert_eq!(err.to_rpc_error().code, -32600);
    }

    #[test]
    fn scalar_record_is_invalid() {
        let err = parse_inbound(b"3", false).unwrap_err();
        assert!(matches!(err, EnvelopeError::Invalid(_)));
    }

    #[test]
    fn missing_version_rejected_unless_allowed() {
        let rec = bytes(json!({"id": 1, "method": "Add"}));
        let inbound = parse_inbound(&rec, false).unwrap();
        assert!(inbound.items[0].is_err());

        let inbound = parse_inbound(&rec, true).unwrap();
        assert!(inbound.items[0].is_ok());
    }

    #[test]
    fn wrong_version_rejected_even_when_lenient() {
        let rec = bytes(json!({"jsonrpc": "1.0", "id": 1, "method": "Add"}));
        let inbound = parse_inbound(&rec, true).unwrap();
        assert!(inbound.items[0].is_err());
    }

    #[test]
    fn null_id_is_notification() {
        let rec = bytes(json!({"jsonrpc": "2.0", "id": null, "method": "Alert"}));
        let inbound = parse_inbound(&rec, false).unwrap();
        assert!(inbound.items[0].as_ref().unwrap().is_notification());
    }

    #[test]
    fn null_params_are_invalid() {
        let rec = bytes(json!({"jsonrpc": "2.0", "id": 1, "method": "Add", "params": null}));
        let inbound = parse_inbound(&rec, false).unwrap();
        assert!(inbound.items[0].is_err());
    }

    #[test]
    fn batch_preserves_member_order_and_errors() {
        let rec = bytes(json!([
            {"jsonrpc": "2.0", "id": 1, "method": "A"},
            42,
            {"jsonrpc": "2.0", "method": "Notify"},
        ]));
        let inbound = parse_inbound(&rec, false).unwrap();
        assert!(inbound.batch);
        assert_eq!(inbound.items.len(), 3);
        assert!(inbound.items[0].is_ok());
        assert!(inbound.items[1].is_err());
        assert!(inbound.items[2].as_ref().unwrap().is_notification());
        // The call and the invalid member reply; the notification is silent.
        assert_eq!(inbound.reply_count(), 2);
    }

    #[test]
    fn duplicate_batch_ids_reject_the_record() {
        let rec = bytes(json!([
            {"jsonrpc": "2.0", "id": 1, "method": "A"},
            {"jsonrpc": "2.0", "id": 1, "method": "B"},
        ]));
        let err = parse_inbound(&rec, false).unwrap_err();
        assert!(matches!(err, EnvelopeError::Invalid(_)));
    }

    #[test]
    fn reply_success_parses() {
        let rec = bytes(json!({"jsonrpc": "2.0", "id": 3, "result": 6}));
        let replies = parse_replies(&rec, false).unwrap();
        match replies[0].as_ref().unwrap() {
            Reply::Response(rsp) => {
                assert_eq!(rsp.id, Some(RequestId::Number(3)));
                assert_eq!(rsp.payload, Ok(json!(6)));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn reply_error_parses() {
        let rec = bytes(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "parse error"}
        }));
        let replies = parse_replies(&rec, false).unwrap();
        match replies[0].as_ref().unwrap() {
            Reply::Response(rsp) => {
                assert_eq!(rsp.id, None);
                assert_eq!(rsp.payload.as_ref().unwrap_err().code, -32700);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn push_parses_as_request() {
        let rec = bytes(json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": 1}}));
        let replies = parse_replies(&rec, false).unwrap();
        match replies[0].as_ref().unwrap() {
            Reply::Push(req) => {
                assert!(req.is_notification());
                assert_eq!(req.method, "tick");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn reply_with_both_result_and_error_is_invalid() {
        let rec = bytes(json!({"jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "x"}}));
        let replies = parse_replies(&rec, false).unwrap();
        assert!(replies[0].is_err());
    }

    #[test]
    fn batch_reply_parses_every_member() {
        let rec = bytes(json!([
            {"jsonrpc": "2.0", "id": 1, "result": 3},
            {"jsonrpc": "2.0", "id": 2, "error": {"code": -32602, "message": "zero divisor"}},
        ]));
        let replies = parse_replies(&rec, false).unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn request_roundtrip_through_parse() {
        let req = Request::call(9, "Math.Add", Some(json!([1, 2])));
        let rec = serde_json::to_vec(&req.to_value()).unwrap();
        let inbound = parse_inbound(&rec, false).unwrap();
        assert_eq!(inbound.items[0].as_ref().unwrap(), &req);
    }
}
