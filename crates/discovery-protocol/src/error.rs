//! Protocol-level error taxonomy (`spec.md` §7, "Protocol errors" and
//! "Session errors"). Tool validation/execution errors are *not* here —
//! those live inside `CallToolResult.isError` per the spec's error design.

use thiserror::Error;

use crate::jsonrpc::JsonRpcError;

/// Errors the protocol engine can raise while parsing or dispatching a
/// JSON-RPC message, before a tool handler is ever invoked.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message was not valid JSON-RPC 2.0.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// No handler is registered for this method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    /// Parameters failed to deserialize into the method's expected shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The session referenced by the request does not exist or has expired.
    #[error("unknown or expired session")]
    UnknownSession,
    /// The request's `Origin` header is not on the allow list.
    #[error("origin not allowed")]
    OriginNotAllowed,
    /// An unexpected internal failure (store unreachable, out of memory).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<&ProtocolError> for JsonRpcError {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::Malformed(detail) => JsonRpcError::invalid_request(detail),
            ProtocolError::UnknownMethod(method) => JsonRpcError::method_not_found(method),
            ProtocolError::InvalidParams(detail) => JsonRpcError::invalid_params(detail),
            ProtocolError::UnknownSession | ProtocolError::OriginNotAllowed => {
                JsonRpcError::server_error(err.to_string())
            }
            ProtocolError::Internal(detail) => JsonRpcError::internal_error(detail),
        }
    }
}
