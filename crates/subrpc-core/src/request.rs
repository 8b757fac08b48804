//! JSON-RPC 2.0 wire types.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// JSON-RPC request ID — string, number, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    /// Numeric correlation id, if this id is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            Self::Null => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RpcId,
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<RpcParam>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            id: RpcId::Number(id),
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

/// Longest rendering of server error `data` before it is cut with an ellipsis.
pub const MAX_ERROR_DATA_LEN: usize = 256;

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, ": {}", format_error_data(data))?;
        }
        Ok(())
    }
}

/// Render server error `data` for humans.
///
/// String data has the Rust `Debug` noise of node errors (`Error("..")`,
/// nested parentheses) flattened; anything else is JSON-stringified. The
/// result is capped at [`MAX_ERROR_DATA_LEN`] characters.
pub fn format_error_data(data: &Value) -> String {
    let rendered = match data {
        Value::String(s) => s
            .replace("Error(\"", "")
            .replace("(\"", "(")
            .replace("\")", ")")
            .replace('(', ", ")
            .replace(')', ""),
        other => other.to_string(),
    };

    if rendered.chars().count() > MAX_ERROR_DATA_LEN {
        let mut cut: String = rendered.chars().take(MAX_ERROR_DATA_LEN).collect();
        cut.push('…');
        cut
    } else {
        rendered
    }
}

/// Any inbound JSON-RPC 2.0 message: a reply (`id` + `result`/`error`) or a
/// subscription notification (`method` + `params`).
///
/// Fields are kept loose so the codec can tell malformed replies apart and
/// still route the failure to the right caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    /// Returns `true` if this message carries `method`, i.e. it is not a reply.
    pub fn is_notification(&self) -> bool {
        self.method.is_some()
    }
}

/// Distinguishes `"result": null` (present) from an absent `result` field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(1, "chain_getBlockHash", vec![Value::from(0)]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"chain_getBlockHash\""));
        assert!(json.contains("\"params\":[0]"));
    }

    #[test]
    fn null_result_is_present() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        assert_eq!(resp.result, Some(Value::Null));
        assert!(resp.error.is_none());

        let resp: JsonRpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":3}"#).unwrap();
        assert!(resp.result.is_none());
    }

    #[test]
    fn error_display_truncates_data() {
        let err = JsonRpcError {
            code: 1010,
            message: "Invalid Transaction".into(),
            data: Some(Value::String("x".repeat(400))),
        };
        let text = err.to_string();
        assert!(text.starts_with("1010: Invalid Transaction: "));
        assert!(text.ends_with('…'));
        let data = text.trim_start_matches("1010: Invalid Transaction: ");
        assert_eq!(data.chars().count(), MAX_ERROR_DATA_LEN + 1);
    }

    #[test]
    fn error_data_noise_is_stripped() {
        let data = Value::String("Error(\"Inability to pay some fees\")".into());
        assert_eq!(format_error_data(&data), "Inability to pay some fees");

        let data = Value::String("Custom(\"BadOrigin\")".into());
        assert_eq!(format_error_data(&data), "Custom, BadOrigin");
    }
}
