use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::error::RpcError;
use crate::types::RequestId;
use crate::JSONRPC_VERSION;

/// A JSON-RPC response: an echoed identifier and exactly one of a result or
/// an error object.
///
/// The identifier is optional only for error replies to requests whose id
/// could not be recovered (parse failures, invalid envelopes); such replies
/// render a `null` id as the specification requires.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub payload: Result<Value, RpcError>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            payload: Ok(result),
        }
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            payload: Err(error),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.payload.is_err()
    }

    /// The successful result, or the error that replaced it.
    pub fn result(&self) -> Result<&Value, &RpcError> {
        self.payload.as_ref()
    }

    /// Decode the successful result into a concrete type. A server error
    /// passes through unchanged; a decode failure reports `InvalidParams`
    /// on the local side.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        match &self.payload {
            Ok(value) => serde_json::from_value(value.clone()).map_err(RpcError::from),
            Err(err) => Err(err.clone()),
        }
    }

    /// Render the response as a wire value. A missing id renders as `null`;
    /// exactly one of `result`/`error` is present.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        obj.insert("id".into(), self.id.as_ref().map_or(Value::Null, |id| json!(id)));
        match &self.payload {
            Ok(result) => obj.insert("result".into(), result.clone()),
            Err(error) => obj.insert("error".into(), json!(error)),
        };
        Value::Object(obj)
    }
}
