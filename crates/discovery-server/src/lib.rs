//! Session manager, tool registry, plugin loader, tool runtime and protocol
//! engine for the discovery MCP server. Module layout mirrors the teacher's
//! `turbomcp-server` crate (`examples/Epistates-turbomcp/crates/turbomcp-server/src/lib.rs`):
//! one file per concern, re-exported flat from here plus a `prelude`.

#![warn(missing_docs, clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![deny(unsafe_code)]

pub mod builtin;
pub mod config;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod runtime;
pub mod session;

pub use config::{ServerConfig, TransportMode};
pub use engine::{Engine, SERVER_NAME, SERVER_VERSION};
pub use error::ServerError;
pub use plugin::{ContentHasher, Manifest, PluginLoader, PluginTable};
pub use registry::{ChangeKind, ToolRegistry};
pub use runtime::{PromptRenderHandler, ResourceReadHandler, SubprocessHandler, ToolHandler, ToolInvocation};
pub use session::{SessionManager, SessionTransport};

/// Default configuration, read from the process environment.
#[must_use]
pub fn default_config() -> ServerConfig {
    ServerConfig::from_env()
}

/// Convenience re-exports for binaries wiring up the server.
pub mod prelude {
    pub use crate::{
        ChangeKind, Engine, ServerConfig, ServerError, SessionManager, SessionTransport,
        SubprocessHandler, ToolHandler, ToolInvocation, ToolRegistry, TransportMode,
        default_config,
    };
}
