use std::fmt;

use serde::{Deserialize, Serialize};

/// A JSON-RPC request identifier: a string or a number, never null.
///
/// Client-assigned identifiers are monotonically increasing integers rendered
/// as JSON numbers; servers must echo whatever form the caller used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// The numeric value, if this identifier is a number.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(_) => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// The `"jsonrpc"` version marker. Only `"2.0"` is valid on the wire;
/// tolerance for its absence is an engine option, not a wire concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Version {
    #[default]
    #[serde(rename = "2.0")]
    V2,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, from_value, json, to_value};

    #[test]
    fn request_id_roundtrip() {
        let n: RequestId = from_value(json!(42)).unwrap();
        assert_eq!(n, RequestId::Number(42));
        assert_eq!(to_value(&n).unwrap(), json!(42));

        let s: RequestId = from_value(json!("abc")).unwrap();
        assert_eq!(s, RequestId::String("abc".to_string()));
        assert_eq!(to_value(&s).unwrap(), json!("abc"));
    }

    #[test]
    fn request_id_display() {
        assert_eq!(RequestId::Number(7).to_string(), "7");
        assert_eq!(RequestId::from("x").to_string(), "\"x\"");
    }

    #[test]
    fn version_marker() {
        assert_eq!(to_value(Version::V2).unwrap(), json!("2.0"));
        assert!(from_str::<Version>("\"2.0\"").is_ok());
        assert!(from_str::<Version>("\"1.0\"").is_err());
    }
}
