//! Wire types, MCP data model and schema pipeline shared by every transport
//! and by the protocol engine. This crate has no knowledge of sessions,
//! plugins or the CMDB — it is the vocabulary the rest of the workspace
//! speaks (see `SPEC_FULL.md` §2).

#![warn(missing_docs, clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod jsonrpc;
pub mod schema;
pub mod types;

pub use error::ProtocolError;
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use types::{
    CallToolParams, CallToolResult, CancelledParams, Capabilities, ContentItem, Implementation,
    InitializeParams, InitializeResult, ListChangedCapability, PromptDescriptor, PromptMessage,
    ResourceContents, ResourceDescriptor, Tool, negotiate_protocol_version,
};
