//! JSON-RPC 2.0 envelope types for the exec agent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// The only protocol version the agent speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request ID: either a string or a number.
///
/// An absent (or `null`) id is modelled as `Option::<RequestId>::None`.
/// The numeric variant keeps the original token, so `1` is echoed as `1`
/// and `1.5` as `1.5`, never as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(serde_json::Number),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// JSON-RPC 2.0 request. A request without an id is a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A frame that could not be turned into a request.
///
/// `id` is whatever could be recovered from the frame before the failure;
/// when it is `None` nothing may be reported back on the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct DecodeError {
    pub id: Option<RequestId>,
    pub error: RpcError,
}

impl DecodeError {
    fn new(id: Option<RequestId>, error: RpcError) -> Self {
        Self { id, error }
    }
}

/// JSON-RPC 2.0 success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcSuccessResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

/// JSON-RPC 2.0 error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: RpcError,
}

/// JSON-RPC 2.0 response (success or error, never both).
///
/// Responses always carry a present id: there is no way to build one for
/// a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Success(RpcSuccessResponse),
    Error(RpcErrorResponse),
}

/// Result of a handler invocation before it is wrapped in a response.
pub type HandlerResult = Result<Value, RpcError>;

// ─────────────────────────────────────────────────────────────────────────────
// Helper constructors
// ─────────────────────────────────────────────────────────────────────────────

impl RpcRequest {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Decode one wire frame into a request.
    ///
    /// Non-JSON frames fail with `ParseError`; everything else that is not a
    /// well-formed request fails with `InvalidRequest`.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(frame).map_err(|e| {
            DecodeError::new(None, RpcError::parse_error(format!("Invalid JSON: {e}")))
        })?;

        let Value::Object(mut obj) = value else {
            return Err(DecodeError::new(
                None,
                RpcError::invalid_request("Frame is not a JSON object"),
            ));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(RequestId::String(s)),
            Some(Value::Number(n)) => Some(RequestId::Number(n)),
            Some(other) => {
                return Err(DecodeError::new(
                    None,
                    RpcError::invalid_request(format!(
                        "Request id must be a string or a number, got {}",
                        json_kind(&other)
                    )),
                ));
            }
        };

        let method = match obj.remove("method") {
            Some(Value::String(m)) if !m.is_empty() => m,
            _ => {
                return Err(DecodeError::new(
                    id,
                    RpcError::invalid_request("Request has no method"),
                ));
            }
        };

        let jsonrpc = match obj.remove("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => v,
            _ => {
                return Err(DecodeError::new(
                    id,
                    RpcError::invalid_request("Unsupported protocol version, expected \"2.0\""),
                ));
            }
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => None,
            Some(p) => Some(p),
        };

        Ok(Self {
            jsonrpc,
            id,
            method,
            params,
        })
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl RpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self::Success(RpcSuccessResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result,
        })
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self::Error(RpcErrorResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            error,
        })
    }

    pub fn from_result(id: RequestId, result: HandlerResult) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::error(id, e),
        }
    }

    pub fn id(&self) -> &RequestId {
        match self {
            Self::Success(r) => &r.id,
            Self::Error(r) => &r.id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self) -> HandlerResult {
        match self {
            Self::Success(r) => Ok(r.result),
            Self::Error(r) => Err(r.error),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
