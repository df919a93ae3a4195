//! JSON-RPC 2.0 wire types shared by every transport.
//!
//! The engine speaks strict JSON-RPC 2.0: a response carries exactly one of
//! `result` or `error`, never both (see `SPEC_FULL.md` §9, "strict JSON-RPC").

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// JSON-RPC version string, always `"2.0"`.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes plus the MCP server-defined range.
pub mod error_codes {
    /// Malformed request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Arguments failed schema validation.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Unexpected internal failure.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Could not parse the request body at all.
    pub const PARSE_ERROR: i32 = -32700;
    /// Server-defined error: timeout, cancellation, session state, auth.
    pub const SERVER_ERROR: i32 = -32000;
}

/// Marker type that serializes as the literal string `"2.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version: {version}"
            )))
        }
    }
}

/// Request identifier: a string or a number, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier.
    String(String),
    /// Numeric identifier.
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A JSON-RPC request or notification as received from a transport.
///
/// `id` is optional at this layer because notifications (e.g.
/// `notifications/cancelled`) are structurally identical to requests minus
/// the id; the engine decides whether a reply is owed based on its presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version, always `"2.0"`.
    pub jsonrpc: JsonRpcVersion,
    /// Method name, e.g. `"tools/call"`.
    pub method: String,
    /// Method parameters, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Present for requests, absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl JsonRpcRequest {
    /// Build a request expecting a reply.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: impl Into<RequestId>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
            id: Some(id.into()),
        }
    }

    /// Build a fire-and-forget notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
            id: None,
        }
    }

    /// A request with no `id` is a notification: no reply is owed.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcError {
    /// Numeric error code, see [`error_codes`].
    pub code: i32,
    /// Human-readable summary.
    pub message: String,
    /// Optional structured detail (offending field, tool name, request id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Build an error with no extra data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail to an error.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32600` invalid request.
    pub fn invalid_request(detail: impl fmt::Display) -> Self {
        Self::new(error_codes::INVALID_REQUEST, format!("Invalid Request: {detail}"))
    }

    /// `-32601` method not found.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// `-32602` invalid params, pointing at the offending field.
    pub fn invalid_params(detail: impl fmt::Display) -> Self {
        Self::new(error_codes::INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    /// `-32603` internal error. Never used for tool execution failures.
    pub fn internal_error(detail: impl fmt::Display) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, format!("Internal error: {detail}"))
    }

    /// `-32000` server-defined error (timeout, cancellation, session state, auth).
    pub fn server_error(detail: impl fmt::Display) -> Self {
        Self::new(error_codes::SERVER_ERROR, detail.to_string())
    }

    /// `-32700` parse error.
    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(error_codes::PARSE_ERROR, format!("Parse error: {detail}"))
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// A JSON-RPC response. `result` and `error` are mutually exclusive by
/// construction — there is no way to build one with both set, which is how
/// this type stays strictly JSON-RPC 2.0 compliant (spec.md §9 flags source
/// handlers that mixed the two).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version, always `"2.0"`.
    pub jsonrpc: JsonRpcVersion,
    #[serde(flatten)]
    payload: JsonRpcPayload,
    /// Echoes the request id; `null` only for requests that failed to parse.
    pub id: Option<RequestId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum JsonRpcPayload {
    Success { result: Value },
    Failure { error: JsonRpcError },
}

impl JsonRpcResponse {
    /// Build a successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            payload: JsonRpcPayload::Success { result },
            id: Some(id),
        }
    }

    /// Build an error response for a request whose id is known.
    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            payload: JsonRpcPayload::Failure { error },
            id,
        }
    }

    /// `true` if this is a success payload.
    pub fn is_success(&self) -> bool {
        matches!(self.payload, JsonRpcPayload::Success { .. })
    }

    /// Borrow the result, if this is a success payload.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            JsonRpcPayload::Success { result } => Some(result),
            JsonRpcPayload::Failure { .. } => None,
        }
    }

    /// Borrow the error, if this is a failure payload.
    pub fn error_object(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            JsonRpcPayload::Success { .. } => None,
            JsonRpcPayload::Failure { error } => Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id() {
        let n = JsonRpcRequest::notification("notifications/initialized", None);
        assert!(n.is_notification());
    }

    #[test]
    fn response_round_trips_success() {
        let resp = JsonRpcResponse::success(RequestId::Number(1), serde_json::json!({"ok": true}));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["result"]["ok"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn response_round_trips_error() {
        let resp = JsonRpcResponse::error(Some(RequestId::Number(1)), JsonRpcError::method_not_found("x"));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32601);
    }

    #[test]
    fn parse_error_has_null_id() {
        let resp = JsonRpcResponse::error(None, JsonRpcError::parse_error("bad json"));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["id"].is_null());
    }
}
