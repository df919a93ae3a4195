//! The MCP Protocol Engine (`spec.md` §4.1): dispatches JSON-RPC methods,
//! formats `CallToolResult`, maps errors to standard codes. Implements
//! [`discovery_transport::MessageSink`] so any transport can drive it
//! without the engine knowing which transport a message arrived on beyond
//! routing the reply back out (`spec.md` §9 "session <-> transport
//! references are one-way").

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use discovery_protocol::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
use discovery_protocol::schema::sanitize;
use discovery_protocol::types::{
    CallToolParams, CallToolResult, CancelledParams, Capabilities, Implementation,
    InitializeParams, InitializeResult, ListChangedCapability,
};
use discovery_transport::{
    Destination, InboundMessage, MessageSink, SessionHint, Transport, TransportError,
    TransportKind,
};
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::{ChangeKind, ToolRegistry};
use crate::runtime;
use crate::session::{SessionManager, SessionTransport};

/// Server identification advertised at `initialize`.
pub const SERVER_NAME: &str = "mcp-discovery-server";
/// Server version advertised at `initialize`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

fn transport_kind_to_session_transport(kind: TransportKind) -> SessionTransport {
    match kind {
        TransportKind::Stdio => SessionTransport::Stdio,
        TransportKind::Http => SessionTransport::Http,
        TransportKind::Amqp => SessionTransport::Amqp,
    }
}

/// Owns the pieces the engine dispatches across: the registry, the session
/// manager, and a handle to every transport it's been wired to so it can
/// route replies and notifications back out. Built once at startup and
/// passed by reference (`spec.md` §9 "global mutable state... expressed as
/// an explicit Server value").
pub struct Engine {
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    transports: DashMap<TransportKind, Arc<dyn Transport>>,
    sse_retry_ms: u64,
}

impl Engine {
    /// Build an engine over an existing registry and session manager.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, sessions: Arc<SessionManager>, config: &ServerConfig) -> Arc<Self> {
        let engine = Arc::new(Self {
            registry,
            sessions,
            transports: DashMap::new(),
            sse_retry_ms: config.http_sse_retry_ms,
        });

        let registry_for_listener = Arc::clone(&engine.registry);
        let engine_for_listener = Arc::downgrade(&engine);
        registry_for_listener.on_change(Arc::new(move |kind| {
            if let Some(engine) = engine_for_listener.upgrade() {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.broadcast_list_changed(kind).await;
                });
            }
        }));

        engine
    }

    /// Wire a transport to this engine. The engine calls `transport.start()`
    /// itself (`spec.md` §9 "this spec requires the engine to drive
    /// start() itself", resolving the AMQP open question) and remembers the
    /// transport so outbound replies can be routed back to it.
    pub async fn attach_transport(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        let kind = transport.kind();
        transport.start(Arc::clone(self) as Arc<dyn MessageSink>).await?;
        self.transports.insert(kind, transport);
        Ok(())
    }

    async fn reply(&self, transport: TransportKind, destination: Destination, response: JsonRpcResponse) {
        let Some(handle) = self.transports.get(&transport) else {
            warn!(?transport, "no transport attached to deliver reply on");
            return;
        };
        let body = serde_json::to_value(&response).unwrap_or_else(|_| json!({"error": "serialization failed"}));
        if let Err(err) = handle.send(destination, body).await {
            error!(%err, "failed to deliver reply");
        }
    }

    async fn broadcast_list_changed(&self, kind: ChangeKind) {
        let method = match kind {
            ChangeKind::Tools => "notifications/tools/listChanged",
            ChangeKind::Resources => "notifications/resources/listChanged",
            ChangeKind::Prompts => "notifications/prompts/listChanged",
        };
        let notification = JsonRpcRequest::notification(method, None);
        let body = serde_json::to_value(&notification).unwrap_or_default();
        let targets: Vec<(TransportKind, Arc<dyn Transport>)> = self
            .transports
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        for (transport_kind, transport) in targets {
            // Fan out to every attached transport; each transport's own
            // session bookkeeping decides who's actually `Ready` to receive
            // it. Best-effort: a delivery failure here never fails the
            // mutation that triggered it.
            let destination = match transport_kind {
                TransportKind::Amqp => Destination::Broadcast(format!("notifications.{}", method_suffix(method))),
                _ => continue, // stdio/http notifications are pushed per-session by callers holding a session id
            };
            let _ = transport.send(destination, body.clone()).await;
        }
    }

    async fn dispatch(
        &self,
        transport: TransportKind,
        session_hint: &SessionHint,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();

        let result = self.dispatch_method(transport, session_hint, &request).await;

        if request.is_notification() {
            if let Err(err) = result {
                warn!(method = %request.method, error = %err, "notification handler failed");
            }
            return None;
        }

        let id = id.unwrap_or(RequestId::Number(0));
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(err) => JsonRpcResponse::error(Some(id), JsonRpcError::from(&err)),
        })
    }

    async fn dispatch_method(
        &self,
        transport: TransportKind,
        session_hint: &SessionHint,
        request: &JsonRpcRequest,
    ) -> Result<Value, ServerError> {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(transport, session_hint, request).await,
            "notifications/initialized" => self.handle_initialized(session_hint),
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_tools_list(session_hint),
            "tools/call" => self.handle_tools_call(session_hint, request).await,
            "resources/list" => self.handle_resources_list(session_hint),
            "resources/read" => self.handle_resources_read(session_hint, request).await,
            "prompts/list" => self.handle_prompts_list(session_hint),
            "prompts/get" => self.handle_prompts_get(session_hint, request).await,
            "notifications/cancelled" => self.handle_cancelled(session_hint, request),
            other => Err(ServerError::MethodNotFound {
                method: other.to_string(),
            }),
        }
    }

    fn session_id(session_hint: &SessionHint) -> Result<String, ServerError> {
        match session_hint {
            SessionHint::Id(id) => Ok(id.clone()),
            SessionHint::Implicit => Err(ServerError::UnknownSession {
                session_id: "<implicit>".to_string(),
            }),
        }
    }

    async fn handle_initialize(
        &self,
        transport: TransportKind,
        session_hint: &SessionHint,
        request: &JsonRpcRequest,
    ) -> Result<Value, ServerError> {
        let params: InitializeParams = parse_params(request)?;
        let session_transport = transport_kind_to_session_transport(transport);

        let session_id = match session_hint {
            SessionHint::Id(id) => id.clone(),
            SessionHint::Implicit => discovery_transport::stdio::STDIO_SESSION.to_string(),
        };
        self.sessions.create_with_id(
            session_id,
            session_transport,
            &params.protocol_version,
            params.client_info,
        )?;

        let negotiated = discovery_protocol::types::negotiate_protocol_version(&params.protocol_version)
            .unwrap_or(discovery_protocol::types::SUPPORTED_PROTOCOL_VERSIONS[0]);

        let result = InitializeResult {
            protocol_version: negotiated.to_string(),
            capabilities: Capabilities {
                tools: Some(ListChangedCapability { list_changed: true }),
                resources: Some(ListChangedCapability { list_changed: true }),
                prompts: Some(ListChangedCapability { list_changed: true }),
            },
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                version: SERVER_VERSION.to_string(),
            },
        };
        serde_json::to_value(result).map_err(|err| ServerError::internal(err.to_string()))
    }

    fn handle_initialized(&self, session_hint: &SessionHint) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        self.sessions.mark_ready(&session_id)?;
        Ok(Value::Null)
    }

    fn handle_tools_list(&self, session_hint: &SessionHint) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        self.sessions.touch(&session_id)?;

        let tools: Vec<Value> = self
            .registry
            .list_tools(None)
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": sanitize(&tool.input_schema),
                })
            })
            .collect();
        Ok(json!({ "tools": tools }))
    }

    async fn handle_tools_call(
        &self,
        session_hint: &SessionHint,
        request: &JsonRpcRequest,
    ) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        self.sessions.touch(&session_id)?;

        let params: CallToolParams = parse_params(request)?;
        let Some((tool, tool_params, handler)) = self.registry.lookup(&params.name) else {
            let result = CallToolResult::error(format!("unknown tool: {}", params.name));
            return serde_json::to_value(result).map_err(|err| ServerError::internal(err.to_string()));
        };

        let request_key = request
            .id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "0".to_string());
        let cancellation = self.sessions.register_request(&session_id, &request_key);

        let schema = tool.input_schema.clone();
        let args: BTreeMap<String, Value> = params.arguments;
        let result = runtime::invoke(&tool.name, &schema, &tool_params, args, handler.as_ref(), cancellation).await;

        self.sessions.complete_request(&session_id, &request_key);
        serde_json::to_value(result).map_err(|err| ServerError::internal(err.to_string()))
    }

    fn handle_resources_list(&self, session_hint: &SessionHint) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        self.sessions.touch(&session_id)?;
        let resources = self.registry.list_resources();
        Ok(json!({ "resources": resources }))
    }

    async fn handle_resources_read(&self, session_hint: &SessionHint, request: &JsonRpcRequest) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        self.sessions.touch(&session_id)?;

        let params: ReadResourceParams = parse_params(request)?;
        let (_descriptor, handler) = self
            .registry
            .get_resource(&params.uri)
            .ok_or_else(|| ServerError::not_found(format!("resource '{}'", params.uri)))?;

        let contents = handler.read(&params.uri).await?;
        Ok(json!({ "contents": [contents] }))
    }

    fn handle_prompts_list(&self, session_hint: &SessionHint) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        self.sessions.touch(&session_id)?;
        let prompts = self.registry.list_prompts();
        Ok(json!({ "prompts": prompts }))
    }

    async fn handle_prompts_get(&self, session_hint: &SessionHint, request: &JsonRpcRequest) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        self.sessions.touch(&session_id)?;

        let params: GetPromptParams = parse_params(request)?;
        let (descriptor, handler) = self
            .registry
            .get_prompt(&params.name)
            .ok_or_else(|| ServerError::not_found(format!("prompt '{}'", params.name)))?;

        let args = params.arguments.unwrap_or_default();
        let args = discovery_protocol::schema::validate_and_apply_defaults(&descriptor.input_schema, &[], args)
            .map_err(|err| ServerError::invalid_params(err.to_string()))?;

        let messages = handler.render(&descriptor.name, &args).await?;
        Ok(json!({ "messages": messages }))
    }

    fn handle_cancelled(&self, session_hint: &SessionHint, request: &JsonRpcRequest) -> Result<Value, ServerError> {
        let session_id = Self::session_id(session_hint)?;
        let params: CancelledParams = parse_params(request)?;
        self.sessions.cancel_request(&session_id, &params.request_id.to_string());
        Ok(Value::Null)
    }
}

#[derive(serde::Deserialize)]
struct ReadResourceParams {
    uri: String,
}

#[derive(serde::Deserialize)]
struct GetPromptParams {
    name: String,
    #[serde(default)]
    arguments: Option<BTreeMap<String, Value>>,
}

fn parse_params<T: serde::de::DeserializeOwned>(request: &JsonRpcRequest) -> Result<T, ServerError> {
    let params = request.params.clone().unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|err| ServerError::invalid_params(err.to_string()))
}

fn method_suffix(method: &str) -> &str {
    method.rsplit('/').next().unwrap_or(method)
}

#[async_trait]
impl MessageSink for Engine {
    async fn on_message(&self, transport: TransportKind, message: InboundMessage) {
        let request: JsonRpcRequest = match serde_json::from_value(message.payload) {
            Ok(request) => request,
            Err(err) => {
                let response = JsonRpcResponse::error(None, JsonRpcError::parse_error(err));
                if let SessionHint::Id(id) = &message.session {
                    self.reply(transport, Destination::Session(id.clone()), response).await;
                }
                return;
            }
        };

        let Some(response) = self.dispatch(transport, &message.session, request).await else {
            return;
        };

        if let SessionHint::Id(id) = &message.session {
            self.reply(transport, Destination::Session(id.clone()), response).await;
        } else {
            warn!("dropping reply: transport supplied no session to route it to");
        }
    }

    async fn on_error(&self, transport: TransportKind, error: TransportError) {
        warn!(?transport, %error, "transport error");
    }

    async fn on_close(&self, _transport: TransportKind, session: SessionHint) {
        if let SessionHint::Id(id) = session {
            self.sessions.close(&id);
        }
    }
}

/// Spawn the idle-TTL sweeper and wire a periodic reminder of the
/// configured SSE retry hint into logs (surfaced to clients via
/// `GET /health`, not repeated here).
pub fn spawn_background_tasks(sessions: &Arc<SessionManager>, sweep_interval: Duration) {
    sessions.spawn_ttl_sweeper(sweep_interval);
}
