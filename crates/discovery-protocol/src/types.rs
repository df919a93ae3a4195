//! MCP data model: tools, resources, prompts, capabilities and the
//! `CallToolResult` envelope (`spec.md` §3 and §4.8).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single content item inside a `CallToolResult` or prompt message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    /// Plain text content.
    Text {
        /// The text body.
        text: String,
    },
    /// A pointer to a CMDB-backed or plugin-backed resource.
    Resource {
        /// Resource URI.
        uri: String,
        /// Optional MIME type.
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentItem {
    /// Convenience constructor for a text item.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// The uniform result shape every `tools/call` produces, on every path
/// (success, validation failure, timeout, cancellation, handler panic).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallToolResult {
    /// Always non-empty (invariant 4, `spec.md` §8).
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError")]
    /// Whether this result represents a failure.
    pub is_error: bool,
}

impl CallToolResult {
    /// Build a successful text result.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(body)],
            is_error: false,
        }
    }

    /// Build an error text result.
    pub fn error(body: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(body)],
            is_error: true,
        }
    }
}

/// A named, schema-described operation reachable via `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Globally unique name, conventionally `<category>_<verb>`.
    pub name: String,
    /// Human-readable description shown to clients.
    pub description: String,
    /// Sanitized, MCP-compliant input schema (see `schema::sanitize`).
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Category used for `tools/list` filtering and naming convention checks.
    pub category: String,
}

/// Static resource exposed through `resources/list` / `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Optional MIME type.
    #[serde(skip_serializing_if = "Option::is_none", rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// Contents returned by `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContents {
    /// Resource URI.
    pub uri: String,
    /// Optional MIME type.
    #[serde(skip_serializing_if = "Option::is_none", rename = "mimeType")]
    pub mime_type: Option<String>,
    /// Text body, when the resource is textual.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 body, when the resource is binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// A prompt template exposed through `prompts/list` / `prompts/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Argument schema, sanitized like tool schemas.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One message in a `prompts/get` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Message role, e.g. `"user"` or `"assistant"`.
    pub role: String,
    /// Message content.
    pub content: ContentItem,
}

/// `clientInfo`/`serverInfo` shape shared by `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    pub version: String,
}

/// Capabilities a side of the connection declares support for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Tool-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ListChangedCapability>,
    /// Resource-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ListChangedCapability>,
    /// Prompt-related capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<ListChangedCapability>,
}

/// A capability that may additionally advertise `listChanged` support.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListChangedCapability {
    /// Whether `notifications/*/listChanged` will be sent for this surface.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// `initialize` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol version the client wants to speak.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client-declared capabilities.
    pub capabilities: Capabilities,
    /// Client identification.
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol version chosen by the server (the highest mutually supported one).
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server-declared capabilities.
    pub capabilities: Capabilities,
    /// Server identification.
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
}

/// Protocol versions the engine understands, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the highest protocol version both sides support, negotiating down
/// when the client requests something older (`spec.md` §4.2).
pub fn negotiate_protocol_version(requested: &str) -> Option<&'static str> {
    if let Some(&exact) = SUPPORTED_PROTOCOL_VERSIONS.iter().find(|&&v| v == requested) {
        return Some(exact);
    }
    // Client asked for something we don't know: offer our newest and let the
    // client decide whether that's acceptable, rather than failing outright.
    SUPPORTED_PROTOCOL_VERSIONS.first().copied()
}

/// `tools/call` request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name.
    pub name: String,
    /// Tool arguments, validated against the tool's input schema.
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
}

/// `notifications/cancelled` params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelledParams {
    /// The id of the request to cancel.
    #[serde(rename = "requestId")]
    pub request_id: crate::jsonrpc::RequestId,
    /// Optional human-readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_exact_match() {
        assert_eq!(negotiate_protocol_version("2025-03-26"), Some("2025-03-26"));
    }

    #[test]
    fn negotiates_down_for_unknown() {
        assert_eq!(negotiate_protocol_version("1999-01-01"), Some("2025-06-18"));
    }

    #[test]
    fn call_tool_result_is_never_empty() {
        let r = CallToolResult::text("hi");
        assert!(!r.content.is_empty());
        assert!(!r.is_error);
    }
}
