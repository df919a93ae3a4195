//! End-to-end engine scenarios driven through `MessageSink`, bypassing real
//! network/broker I/O the way the teacher's own router tests drive
//! `turbomcp-server::routing` directly rather than through a live socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use discovery_cmdb::Store;
use discovery_protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use discovery_protocol::types::{
    CallToolResult, Capabilities, Implementation, InitializeParams,
};
use discovery_server::config::{ServerConfig, TransportMode};
use discovery_server::engine::Engine;
use discovery_server::registry::ToolRegistry;
use discovery_server::runtime::{ToolHandler, ToolInvocation};
use discovery_server::session::SessionManager;
use discovery_server::builtin;
use discovery_transport::{
    Destination, InboundMessage, MessageSink, SessionHint, Transport, TransportError,
    TransportKind, TransportMetrics,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

struct MockTransport {
    kind: TransportKind,
    sent: Mutex<Vec<(Destination, Value)>>,
}

impl MockTransport {
    fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn replies(&self) -> Vec<Value> {
        self.sent.lock().unwrap().iter().map(|(_, v)| v.clone()).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start(&self, _sink: Arc<dyn MessageSink>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, to: Destination, message: Value) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((to, message));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn metrics(&self) -> TransportMetrics {
        TransportMetrics::default()
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        transport_mode: TransportMode::Http,
        http_port: 0,
        http_session_ttl: Duration::from_secs(60),
        http_sse_retry_ms: 3000,
        http_allowed_origins: Vec::new(),
        amqp_url: None,
        amqp_queue_prefix: "mcp.discovery".to_string(),
        amqp_exchange: "mcp.notifications".to_string(),
        amqp_response_timeout: Duration::from_secs(5),
        strict_capabilities: false,
        cmdb_path: "unused.db".into(),
        cmdb_key_file: "unused.key".into(),
        plugins_dir: "unused-plugins".into(),
    }
}

async fn build_engine() -> (Arc<Engine>, Arc<MockTransport>) {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let registry = Arc::new(ToolRegistry::new());
    builtin::register_all(&registry, store).unwrap();
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60)));
    let config = test_config();
    let engine = Engine::new(registry, sessions, &config);

    let transport = Arc::new(MockTransport::new(TransportKind::Http));
    engine
        .attach_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .await
        .unwrap();
    (engine, transport)
}

fn initialize_request(id: i64) -> JsonRpcRequest {
    let params = InitializeParams {
        protocol_version: "2025-03-26".to_string(),
        capabilities: Capabilities::default(),
        client_info: Implementation {
            name: "integration-test".to_string(),
            version: "0.0.0".to_string(),
        },
    };
    JsonRpcRequest::new("initialize", Some(serde_json::to_value(params).unwrap()), id)
}

fn last_response(replies: &[Value]) -> JsonRpcResponse {
    serde_json::from_value(replies.last().cloned().expect("no reply captured")).unwrap()
}

#[tokio::test]
async fn initialize_then_tools_list_then_tools_call_succeeds() {
    let (engine, transport) = build_engine().await;
    let session = SessionHint::Id("session-a".to_string());

    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session: session.clone(),
                payload: serde_json::to_value(initialize_request(1)).unwrap(),
            },
        )
        .await;
    let init_response = last_response(&transport.replies());
    assert!(init_response.is_success(), "initialize should succeed: {init_response:?}");

    let list_request = JsonRpcRequest::new("tools/list", None, 2);
    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session: session.clone(),
                payload: serde_json::to_value(list_request).unwrap(),
            },
        )
        .await;
    let list_response = last_response(&transport.replies());
    let result = list_response.result().cloned().expect("tools/list should succeed");
    let tools = result["tools"].as_array().expect("tools array");
    assert!(tools.iter().any(|t| t["name"] == "network_ping"));
    let memory_tool = tools
        .iter()
        .find(|t| t["name"] == "cmdb_memory_stats")
        .expect("cmdb_memory_stats registered");
    assert_eq!(memory_tool["inputSchema"]["additionalProperties"], json!(false));
    assert!(memory_tool["inputSchema"].get("$schema").is_none());

    let call_request = JsonRpcRequest::new(
        "tools/call",
        Some(json!({"name": "cmdb_memory_stats", "arguments": {}})),
        3,
    );
    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session,
                payload: serde_json::to_value(call_request).unwrap(),
            },
        )
        .await;
    let call_response = last_response(&transport.replies());
    let result = call_response.result().cloned().expect("tools/call should succeed");
    let call_result: CallToolResult = serde_json::from_value(result).unwrap();
    assert!(!call_result.is_error);
}

#[tokio::test]
async fn tools_list_without_initialize_is_unknown_session() {
    let (engine, transport) = build_engine().await;
    let request = JsonRpcRequest::new("tools/list", None, 1);
    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session: SessionHint::Id("ghost-session".to_string()),
                payload: serde_json::to_value(request).unwrap(),
            },
        )
        .await;
    let response = last_response(&transport.replies());
    assert!(!response.is_success());
}

struct SleepForeverHandler;

#[async_trait]
impl ToolHandler for SleepForeverHandler {
    async fn call(&self, _invocation: ToolInvocation) -> CallToolResult {
        tokio::time::sleep(Duration::from_secs(600)).await;
        CallToolResult::text("should never get here")
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }
}

#[tokio::test]
async fn cancellation_completes_promptly() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let registry = Arc::new(ToolRegistry::new());
    builtin::register_all(&registry, store).unwrap();
    registry
        .register_tool(
            discovery_protocol::types::Tool {
                name: "slow_tool".to_string(),
                description: "never completes on its own".to_string(),
                input_schema: discovery_protocol::schema::build_schema(&[]),
                category: "test".to_string(),
            },
            Vec::new(),
            Arc::new(SleepForeverHandler),
            None,
        )
        .unwrap();
    let sessions = Arc::new(SessionManager::new(Duration::from_secs(60)));
    let config = test_config();
    let engine = Engine::new(registry, sessions, &config);
    let transport = Arc::new(MockTransport::new(TransportKind::Http));
    engine
        .attach_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .await
        .unwrap();

    let session = SessionHint::Id("session-cancel".to_string());
    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session: session.clone(),
                payload: serde_json::to_value(initialize_request(1)).unwrap(),
            },
        )
        .await;

    let call_request = JsonRpcRequest::new(
        "tools/call",
        Some(json!({"name": "slow_tool", "arguments": {}})),
        42,
    );
    let engine_for_call = Arc::clone(&engine);
    let session_for_call = session.clone();
    let call_task = tokio::spawn(async move {
        engine_for_call
            .on_message(
                TransportKind::Http,
                InboundMessage {
                    session: session_for_call,
                    payload: serde_json::to_value(call_request).unwrap(),
                },
            )
            .await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancel = JsonRpcRequest::notification(
        "notifications/cancelled",
        Some(json!({"requestId": 42})),
    );
    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session,
                payload: serde_json::to_value(cancel).unwrap(),
            },
        )
        .await;

    tokio::time::timeout(Duration::from_secs(2), call_task)
        .await
        .expect("tools/call did not finish within 2s of cancellation")
        .unwrap();

    let replies = transport.replies();
    let call_response: JsonRpcResponse = serde_json::from_value(
        replies
            .iter()
            .rev()
            .find(|r| r["id"] == json!(42))
            .cloned()
            .expect("no reply for request 42"),
    )
    .unwrap();
    let result = call_response
        .result()
        .cloned()
        .expect("cancelled call still returns a result, not a JSON-RPC error");
    let call_result: CallToolResult = serde_json::from_value(result).unwrap();
    assert!(call_result.is_error);
}

#[tokio::test]
async fn session_ttl_expiry_yields_unknown_session() {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let registry = Arc::new(ToolRegistry::new());
    builtin::register_all(&registry, store).unwrap();
    let sessions = Arc::new(SessionManager::new(Duration::from_millis(50)));
    let config = test_config();
    let engine = Engine::new(registry, sessions, &config);
    let transport = Arc::new(MockTransport::new(TransportKind::Http));
    engine
        .attach_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .await
        .unwrap();

    let session = SessionHint::Id("session-ttl".to_string());
    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session: session.clone(),
                payload: serde_json::to_value(initialize_request(1)).unwrap(),
            },
        )
        .await;
    assert!(last_response(&transport.replies()).is_success());

    tokio::time::sleep(Duration::from_millis(200)).await;

    let list_request = JsonRpcRequest::new("tools/list", None, 2);
    engine
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session,
                payload: serde_json::to_value(list_request).unwrap(),
            },
        )
        .await;
    assert!(!last_response(&transport.replies()).is_success());
}
