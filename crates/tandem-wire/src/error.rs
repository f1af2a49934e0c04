use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error_codes;

/// Classified JSON-RPC error codes.
///
/// The standard codes are given by the specification; `Cancelled` is a local
/// extension reported for calls torn down by `rpc.cancel`, and `ServerError`
/// covers the reserved user-defined range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Cancelled,
    /// User-defined error in the reserved -32099..=-32000 range.
    ServerError(i64),
    /// Any other code; carried through verbatim.
    Other(i64),
}

impl ErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            ErrorCode::ParseError => error_codes::PARSE_ERROR,
            ErrorCode::InvalidRequest => error_codes::INVALID_REQUEST,
            ErrorCode::MethodNotFound => error_codes::METHOD_NOT_FOUND,
            ErrorCode::InvalidParams => error_codes::INVALID_PARAMS,
            ErrorCode::InternalError => error_codes::INTERNAL_ERROR,
            ErrorCode::Cancelled => error_codes::CANCELLED,
            ErrorCode::ServerError(code) | ErrorCode::Other(code) => *code,
        }
    }

    /// The canonical wire message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse error",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::InvalidParams => "invalid params",
            ErrorCode::InternalError => "internal error",
            ErrorCode::Cancelled => "request cancelled",
            ErrorCode::ServerError(_) => "server error",
            ErrorCode::Other(_) => "error",
        }
    }

    /// Recover the classification for a numeric code received off the wire.
    pub fn from_code(code: i64) -> ErrorCode {
        match code {
            error_codes::PARSE_ERROR => ErrorCode::ParseError,
            error_codes::INVALID_REQUEST => ErrorCode::InvalidRequest,
            error_codes::METHOD_NOT_FOUND => ErrorCode::MethodNotFound,
            error_codes::INVALID_PARAMS => ErrorCode::InvalidParams,
            error_codes::INTERNAL_ERROR => ErrorCode::InternalError,
            error_codes::CANCELLED => ErrorCode::Cancelled,
            c if (error_codes::SERVER_ERROR_START..=error_codes::SERVER_ERROR_END).contains(&c) => {
                ErrorCode::ServerError(c)
            }
            c => ErrorCode::Other(c),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// The JSON-RPC error object: `{code, message, data?}`.
///
/// This is both the wire representation inside error responses and the typed
/// error that handlers return and client callers observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach auxiliary data to the error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(ErrorCode::ParseError, ErrorCode::ParseError.message())
    }

    pub fn invalid_request() -> Self {
        Self::new(ErrorCode::InvalidRequest, ErrorCode::InvalidRequest.message())
    }

    pub fn method_not_found() -> Self {
        Self::new(ErrorCode::MethodNotFound, ErrorCode::MethodNotFound.message())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, ErrorCode::Cancelled.message())
    }

    /// A user-defined error in the reserved server range. The code is clamped
    /// into -32099..=-32000.
    pub fn server_error(code: i64, message: impl Into<String>) -> Self {
        let code = code.clamp(
            crate::error_codes::SERVER_ERROR_START,
            crate::error_codes::SERVER_ERROR_END,
        );
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == error_codes::CANCELLED
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::invalid_params(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standard_codes() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::InternalError.code(), -32603);
        assert_eq!(ErrorCode::Cancelled.code(), -32001);
    }

    #[test]
    fn from_code_classifies_ranges() {
        assert_eq!(ErrorCode::from_code(-32700), ErrorCode::ParseError);
        assert_eq!(ErrorCode::from_code(-32001), ErrorCode::Cancelled);
        assert_eq!(ErrorCode::from_code(-32050), ErrorCode::ServerError(-32050));
        assert_eq!(ErrorCode::from_code(404), ErrorCode::Other(404));
    }

    #[test]
    fn data_is_omitted_when_absent() {
        let err = RpcError::method_not_found();
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v, json!({"code": -32601, "message": "method not found"}));
    }

    #[test]
    fn data_is_carried_when_present() {
        let err = RpcError::internal_error("boom").with_data(json!("stack"));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["data"], json!("stack"));
    }

    #[test]
    fn server_error_is_clamped_into_range() {
        assert_eq!(RpcError::server_error(-32050, "x").code, -32050);
        assert_eq!(RpcError::server_error(-1, "x").code, -32000);
        assert_eq!(RpcError::server_error(-40000, "x").code, -32099);
    }
}
