use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::error::RpcError;
use crate::types::RequestId;
use crate::JSONRPC_VERSION;

/// A JSON-RPC request or notification.
///
/// A request with `id == None` is a notification: the peer must not reply to
/// it. Params, when present, are restricted to a JSON object or array.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    /// A call: a request carrying an identifier that expects a reply.
    pub fn call(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// A notification: a request without an identifier; no reply is produced.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Decode the params payload into a concrete type. Absent params decode
    /// as JSON `null`, so optional parameter types work transparently.
    /// Failures report `InvalidParams`.
    pub fn decode_params<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let value = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(RpcError::from)
    }

    /// Render the request as a wire value. Params are omitted (not null)
    /// when absent, and the id is omitted for notifications.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        if let Some(id) = &self.id {
            obj.insert("id".into(), json!(id));
        }
        obj.insert("method".into(), json!(self.method));
        if let Some(params) = &self.params {
            obj.insert("params".into(), params.clone());
        }
        Value::Object(obj)
    }
}

/// Whether a params payload satisfies the envelope restriction: params must
/// be a JSON object or array when present.
pub fn params_are_structured(params: &Value) -> bool {
    params.is_object() || params.is_array()
}
