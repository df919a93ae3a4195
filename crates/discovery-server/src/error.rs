//! Server-level error taxonomy (`spec.md` §7), grounded on the teacher's
//! `turbomcp-server::error::ServerError`
//! (`examples/Epistates-turbomcp/crates/turbomcp-server/src/error.rs`):
//! `#[non_exhaustive]` thiserror enum with named fields, one constructor
//! method per variant.

use discovery_protocol::jsonrpc::{JsonRpcError, error_codes};

/// Errors surfaced by the session manager, registry, plugin loader and
/// engine. `ServerError` never crosses the JSON-RPC boundary directly —
/// [`From<&ServerError> for JsonRpcError`] performs that mapping once, at
/// the engine's top-level boundary (`spec.md` §9 "exceptions for control
/// flow are replaced by result/error types").
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServerError {
    /// A handler rejected the request for a domain reason.
    #[error("handler error: {message}")]
    Handler {
        /// Human-readable explanation.
        message: String,
    },
    /// Malformed or out-of-range parameters.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// Human-readable explanation.
        message: String,
        /// Offending field, if identifiable.
        field: Option<String>,
    },
    /// The requested method has no registered handler.
    #[error("method not found: {method}")]
    MethodNotFound {
        /// The unsupported JSON-RPC method.
        method: String,
    },
    /// A named resource (tool, resource, prompt, session) does not exist.
    #[error("not found: {resource}")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// Registering a tool/resource/prompt whose name already exists
    /// (`spec.md` §3 "tool names are unique").
    #[error("name collision: {name}")]
    NameCollision {
        /// The colliding name.
        name: String,
    },
    /// A plugin manifest's declared content hash did not match the
    /// computed hash of its distribution directory.
    #[error("plugin integrity error for {plugin_id}: {message}")]
    Integrity {
        /// Plugin identifier.
        plugin_id: String,
        /// Explanation (hash mismatch, missing file, duplicate checksum…).
        message: String,
    },
    /// A plugin declared external dependencies under a `bundled-only`
    /// policy.
    #[error("policy error for {plugin_id}: {message}")]
    Policy {
        /// Plugin identifier.
        plugin_id: String,
        /// Explanation.
        message: String,
    },
    /// Strict-mode capability/tool mismatch.
    #[error("capability mismatch for {plugin_id}: {message}")]
    CapabilityMismatch {
        /// Plugin identifier.
        plugin_id: String,
        /// Explanation.
        message: String,
    },
    /// Plugin manifest parse/entry-point failure.
    #[error("load error for {plugin_id}: {message}")]
    Load {
        /// Plugin identifier.
        plugin_id: String,
        /// Explanation.
        message: String,
    },
    /// Session lookup failed.
    #[error("unknown session: {session_id}")]
    UnknownSession {
        /// The session id the caller presented.
        session_id: String,
    },
    /// `Origin` header failed validation.
    #[error("origin not allowed: {origin}")]
    OriginNotAllowed {
        /// The rejected origin.
        origin: String,
    },
    /// An operation exceeded its deadline.
    #[error("timeout during {operation} after {timeout_ms}ms")]
    Timeout {
        /// What was being attempted.
        operation: String,
        /// The configured deadline.
        timeout_ms: u64,
    },
    /// The CMDB or another backing store is unreachable or wedged.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable explanation, safe to log but not to leak details
        /// from (no secrets included).
        message: String,
    },
}

impl ServerError {
    /// Build a [`ServerError::Handler`].
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Build a [`ServerError::InvalidParams`] with no specific field.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            field: None,
        }
    }

    /// Build a [`ServerError::InvalidParams`] pointing at `field`.
    pub fn invalid_params_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Build a [`ServerError::NotFound`].
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Build a [`ServerError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<&ServerError> for JsonRpcError {
    fn from(err: &ServerError) -> Self {
        match err {
            ServerError::Handler { message } => JsonRpcError::server_error(message),
            ServerError::InvalidParams { message, field } => {
                let text = match field {
                    Some(field) => format!("{message} (field: {field})"),
                    None => message.clone(),
                };
                JsonRpcError::invalid_params(text)
            }
            ServerError::MethodNotFound { method } => JsonRpcError::method_not_found(method),
            ServerError::NotFound { resource } => {
                JsonRpcError::new(error_codes::SERVER_ERROR, format!("not found: {resource}"))
            }
            ServerError::NameCollision { name } => {
                JsonRpcError::new(error_codes::SERVER_ERROR, format!("name collision: {name}"))
            }
            ServerError::Integrity { plugin_id, message } => JsonRpcError::new(
                error_codes::SERVER_ERROR,
                format!("plugin '{plugin_id}' failed integrity check: {message}"),
            ),
            ServerError::Policy { plugin_id, message } => JsonRpcError::new(
                error_codes::SERVER_ERROR,
                format!("plugin '{plugin_id}' violates policy: {message}"),
            ),
            ServerError::CapabilityMismatch { plugin_id, message } => JsonRpcError::new(
                error_codes::SERVER_ERROR,
                format!("plugin '{plugin_id}' capability mismatch: {message}"),
            ),
            ServerError::Load { plugin_id, message } => JsonRpcError::new(
                error_codes::SERVER_ERROR,
                format!("plugin '{plugin_id}' failed to load: {message}"),
            ),
            ServerError::UnknownSession { session_id } => JsonRpcError::new(
                error_codes::SERVER_ERROR,
                format!("unknown session: {session_id}"),
            ),
            ServerError::OriginNotAllowed { origin } => JsonRpcError::new(
                error_codes::SERVER_ERROR,
                format!("origin not allowed: {origin}"),
            ),
            ServerError::Timeout { operation, timeout_ms } => JsonRpcError::new(
                error_codes::SERVER_ERROR,
                format!("timeout during {operation} after {timeout_ms}ms"),
            ),
            ServerError::Internal { message } => JsonRpcError::internal_error(message),
        }
    }
}
