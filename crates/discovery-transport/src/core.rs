//! The transport contract every wire protocol implements
//! (`spec.md` §4.7): `start`/`send`/`close` plus handler registration, kept
//! deliberately narrower than the teacher's `Transport` trait
//! (`examples/Epistates-turbomcp/crates/turbomcp-transport/src/core.rs`),
//! which also models connection-level `connect`/`disconnect`/`metrics` that
//! this workspace's engine-owned lifecycle doesn't need.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a transport implementation.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The transport could not bind/connect to its endpoint.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// A send failed after the transport was established.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The peer sent something that isn't a well-formed JSON-RPC envelope.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The referenced session is unknown (HTTP: missing/unknown
    /// `Mcp-Session-Id` → caller should answer `404`).
    #[error("unknown session: {0}")]
    UnknownSession(String),
    /// `Origin` header failed validation (HTTP → caller should answer `403`).
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),
    /// The transport was asked to send/start after `close()`.
    #[error("transport closed")]
    Closed,
    /// Wraps a lower-level I/O or broker client error.
    #[error("transport io error: {0}")]
    Io(String),
}

/// Which wire protocol a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Newline-delimited JSON over stdin/stdout.
    Stdio,
    /// Streamable HTTP + SSE.
    Http,
    /// AMQP request/reply + notification fan-out.
    Amqp,
}

/// Transport-supplied hint about which session a message belongs to.
/// Stdio has exactly one implicit session and never supplies a hint; HTTP
/// and AMQP always can (header / reply-queue identity respectively).
#[derive(Debug, Clone)]
pub enum SessionHint {
    /// No existing session is implied; the engine must be handling
    /// `initialize` or the transport's sole implicit session.
    Implicit,
    /// An opaque session id supplied by the peer.
    Id(String),
}

/// One inbound JSON-RPC payload plus the session it arrived on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Which session this message claims to belong to.
    pub session: SessionHint,
    /// The parsed JSON-RPC request/notification body.
    pub payload: Value,
}

/// Callback surface a transport invokes as events occur. The engine
/// implements this once and hands an `Arc<dyn MessageSink>` to every
/// transport's `start()` (`spec.md` §4.7 `onmessage/onerror/onclose`).
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// A complete inbound message was parsed.
    async fn on_message(&self, transport: TransportKind, message: InboundMessage);
    /// The transport hit a recoverable error (logged, session untouched).
    async fn on_error(&self, transport: TransportKind, error: TransportError);
    /// A session-carrying connection was torn down (stdio: process exit;
    /// HTTP: DELETE or stream drop; AMQP: reply queue deleted).
    async fn on_close(&self, transport: TransportKind, session: SessionHint);
}

/// A destination for an outbound message: either a specific session or,
/// for AMQP, a notification fan-out routing key.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Deliver to one session.
    Session(String),
    /// Fan out a notification under this routing key
    /// (`notifications.<kind>` / `discovery.<category>`, `spec.md` §4.7.3).
    Broadcast(String),
}

/// Point-in-time counters surfaced on `GET /health` and CLI `stats`.
#[derive(Debug, Clone, Default)]
pub struct TransportMetrics {
    /// Messages received since start.
    pub messages_in: u64,
    /// Messages sent since start.
    pub messages_out: u64,
    /// Currently open sessions (0 or 1 for stdio).
    pub active_sessions: u64,
}

/// Common transport contract (`spec.md` §4.7). `start` is idempotent and
/// owns its own I/O loop; `send` must be callable concurrently from any
/// task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which wire protocol this is, for logging and `MessageSink` dispatch.
    fn kind(&self) -> TransportKind;

    /// Begin accepting/reading. Called exactly once by whoever wires the
    /// transport to the engine; a second call is a no-op.
    async fn start(&self, sink: Arc<dyn MessageSink>) -> Result<(), TransportError>;

    /// Serialize and deliver one outbound message.
    async fn send(&self, to: Destination, message: Value) -> Result<(), TransportError>;

    /// Drain in-flight work and release resources. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Snapshot counters for health/metrics reporting.
    async fn metrics(&self) -> TransportMetrics;
}

/// Per-transport custom knobs, read once at construction. Kept as a loose
/// string map (mirroring the teacher's `TransportConfig::custom`) since
/// each transport only cares about a handful of its own keys.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Free-form settings (e.g. `bind_addr`, `amqp_uri`).
    pub settings: HashMap<String, String>,
}

/// Read-only view onto the engine's tool catalog, for transports that need
/// a count without depending on `discovery-server` (mirroring the
/// teacher's `turbomcp-transport::server` traits — `ToolHandler`,
/// `PromptHandler`, `ResourceHandler` — which the same way let a
/// lower-level transport crate call into a higher-level server crate
/// through a trait object instead of a direct dependency).
pub trait ToolCatalog: Send + Sync {
    /// Number of tools currently registered (built-in and plugin-provided).
    fn tool_count(&self) -> usize;
}
