//! Streamable HTTP + SSE transport (`spec.md` §4.7.2). Built on `axum`, the
//! HTTP stack the teacher workspace already depends on for its own HTTP
//! transport, with a resumable per-session SSE ring buffer replacing the
//! teacher's plain broadcast channel since this spec requires
//! `Last-Event-ID` replay.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::core::{
    Destination, InboundMessage, MessageSink, SessionHint, ToolCatalog, Transport,
    TransportError, TransportKind, TransportMetrics,
};

/// Ring buffer capacity for SSE replay (`spec.md` §4.7.2 "retained until
/// session close or ring-buffer limit").
const SSE_RING_CAPACITY: usize = 256;

const HEADER_SESSION_ID: &str = "Mcp-Session-Id";

struct SseHistory {
    next_id: u64,
    events: VecDeque<(u64, Value)>,
}

impl SseHistory {
    fn new() -> Self {
        Self {
            next_id: 0,
            events: VecDeque::with_capacity(SSE_RING_CAPACITY),
        }
    }

    fn push(&mut self, payload: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if self.events.len() == SSE_RING_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back((id, payload));
        id
    }

    fn replay_from(&self, last_event_id: Option<u64>) -> Vec<(u64, Value)> {
        match last_event_id {
            None => Vec::new(),
            Some(last) => self
                .events
                .iter()
                .filter(|(id, _)| *id > last)
                .cloned()
                .collect(),
        }
    }
}

struct HttpSession {
    history: Mutex<SseHistory>,
    sender: broadcast::Sender<Value>,
}

struct AppState {
    sessions: DashMap<String, Arc<HttpSession>>,
    sink: Arc<dyn MessageSink>,
    allowed_origins: Vec<String>,
    tool_catalog: Arc<dyn ToolCatalog>,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
}

/// Streamable HTTP + SSE transport. `start()` binds `bind_addr` and serves
/// `/mcp` and `/health` until `close()`.
pub struct HttpTransport {
    bind_addr: String,
    allowed_origins: Vec<String>,
    tool_catalog: Arc<dyn ToolCatalog>,
    state: Mutex<Option<Arc<AppState>>>,
    shutdown: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl HttpTransport {
    /// `allowed_origins` empty means "accept any Origin" (local/dev use);
    /// production deployments should pass an explicit allow-list.
    /// `tool_catalog` backs the `tools` count on `GET /health` (`spec.md`
    /// §6) without this crate depending on the registry's owning crate.
    #[must_use]
    pub fn new(
        bind_addr: impl Into<String>,
        allowed_origins: Vec<String>,
        tool_catalog: Arc<dyn ToolCatalog>,
    ) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            allowed_origins,
            tool_catalog,
            state: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    fn origin_allowed(allowed: &[String], headers: &HeaderMap) -> bool {
        if allowed.is_empty() {
            return true;
        }
        match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
            Some(origin) => allowed.iter().any(|a| a == origin),
            None => true,
        }
    }

    /// Build the CORS layer matching `allowed_origins` (`spec.md` §6
    /// `OPTIONS /* — CORS preflight, 204`): empty means any origin, else
    /// an explicit allow-list mirroring `origin_allowed`'s per-request check.
    fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
        let allow_origin = if allowed_origins.is_empty() {
            AllowOrigin::any()
        } else {
            let origins: Vec<HeaderValue> = allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect();
            AllowOrigin::list(origins)
        };
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any)
    }
}

fn session_id_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn post_mcp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !HttpTransport::origin_allowed(&state.allowed_origins, &headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let is_initialize = body.get("method").and_then(Value::as_str) == Some("initialize");
    let session_id = match session_id_header(&headers) {
        Some(id) => {
            if !state.sessions.contains_key(&id) {
                return (StatusCode::NOT_FOUND, "unknown session").into_response();
            }
            id
        }
        None if is_initialize => {
            let id = Uuid::new_v4().to_string();
            let (sender, _) = broadcast::channel(64);
            state.sessions.insert(
                id.clone(),
                Arc::new(HttpSession {
                    history: Mutex::new(SseHistory::new()),
                    sender,
                }),
            );
            id
        }
        None => return (StatusCode::NOT_FOUND, "missing Mcp-Session-Id").into_response(),
    };

    state.messages_in.fetch_add(1, Ordering::Relaxed);
    state
        .sink
        .on_message(
            TransportKind::Http,
            InboundMessage {
                session: SessionHint::Id(session_id.clone()),
                payload: body,
            },
        )
        .await;

    let mut response = Json(json!({"accepted": true})).into_response();
    if is_initialize {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            response.headers_mut().insert(HEADER_SESSION_ID, value);
        }
    }
    response
}

async fn get_mcp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, Response> {
    if !HttpTransport::origin_allowed(&state.allowed_origins, &headers) {
        return Err((StatusCode::FORBIDDEN, "origin not allowed").into_response());
    }
    let Some(session_id) = session_id_header(&headers) else {
        return Err((StatusCode::NOT_FOUND, "missing Mcp-Session-Id").into_response());
    };
    let Some(session) = state.sessions.get(&session_id).map(|e| Arc::clone(&e)) else {
        return Err((StatusCode::NOT_FOUND, "unknown session").into_response());
    };

    let last_event_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let replay = session.history.lock().await.replay_from(last_event_id);
    let mut receiver = session.sender.subscribe();

    let replay_stream = stream::iter(replay.into_iter().map(|(id, payload)| {
        Ok(Event::default().id(id.to_string()).json_data(payload).unwrap_or_default())
    }));

    let live_stream = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    let event = Event::default().json_data(payload).unwrap_or_default();
                    return Some((Ok::<_, std::convert::Infallible>(event), receiver));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });

    Ok(Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::default()))
}

async fn delete_mcp(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_header(&headers) else {
        return (StatusCode::NOT_FOUND, "missing Mcp-Session-Id").into_response();
    };
    if state.sessions.remove(&session_id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }
    state
        .sink
        .on_close(TransportKind::Http, SessionHint::Id(session_id))
        .await;
    StatusCode::NO_CONTENT.into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "tools": state.tool_catalog.tool_count(),
        "sessions": state.sessions.len(),
    }))
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self, sink: Arc<dyn MessageSink>) -> Result<(), TransportError> {
        let mut guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let app_state = Arc::new(AppState {
            sessions: DashMap::new(),
            sink,
            allowed_origins: self.allowed_origins.clone(),
            tool_catalog: Arc::clone(&self.tool_catalog),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
        });
        *guard = Some(Arc::clone(&app_state));
        drop(guard);

        let router = Router::new()
            .route("/mcp", post(post_mcp).get(get_mcp).delete(delete_mcp))
            .route("/health", get(health))
            .with_state(app_state)
            .layer(Self::cors_layer(&self.allowed_origins));

        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        *self.shutdown.lock().await = Some(tx);

        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        Ok(())
    }

    async fn send(&self, to: Destination, message: Value) -> Result<(), TransportError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(TransportError::Closed)?;

        let Destination::Session(session_id) = to else {
            return Err(TransportError::Protocol(
                "http transport does not support broadcast destinations".to_string(),
            ));
        };
        let session = state
            .sessions
            .get(&session_id)
            .ok_or_else(|| TransportError::UnknownSession(session_id.clone()))?;

        let event_id = session.history.lock().await.push(message.clone());
        let _ = session.sender.send(message);
        let _ = event_id;
        state.messages_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    async fn metrics(&self) -> TransportMetrics {
        match self.state.lock().await.as_ref() {
            Some(state) => TransportMetrics {
                messages_in: state.messages_in.load(Ordering::Relaxed),
                messages_out: state.messages_out.load(Ordering::Relaxed),
                active_sessions: state.sessions.len() as u64,
            },
            None => TransportMetrics::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_history_replays_only_events_after_last_id() {
        let mut history = SseHistory::new();
        let e1 = history.push(json!({"n": 1}));
        let e2 = history.push(json!({"n": 2}));
        let _e3 = history.push(json!({"n": 3}));

        let replay = history.replay_from(Some(e1));
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].0, e2);

        assert!(history.replay_from(None).is_empty());
    }

    #[test]
    fn sse_history_evicts_oldest_past_ring_capacity() {
        let mut history = SseHistory::new();
        for n in 0..(SSE_RING_CAPACITY + 10) {
            history.push(json!({"n": n}));
        }
        assert_eq!(history.events.len(), SSE_RING_CAPACITY);
        let oldest_id = history.events.front().unwrap().0;
        assert_eq!(oldest_id, 10);
    }

    #[test]
    fn origin_allowed_accepts_any_origin_when_allow_list_empty() {
        let headers = HeaderMap::new();
        assert!(HttpTransport::origin_allowed(&[], &headers));
    }

    #[test]
    fn origin_allowed_rejects_origin_outside_allow_list() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        let allowed = vec!["https://trusted.example".to_string()];
        assert!(!HttpTransport::origin_allowed(&allowed, &headers));
    }

    #[test]
    fn origin_allowed_accepts_listed_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://trusted.example"));
        let allowed = vec!["https://trusted.example".to_string()];
        assert!(HttpTransport::origin_allowed(&allowed, &headers));
    }

    struct EmptyCatalog;
    impl ToolCatalog for EmptyCatalog {
        fn tool_count(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn send_before_start_is_closed() {
        let transport = HttpTransport::new("127.0.0.1:0", Vec::new(), Arc::new(EmptyCatalog));
        let err = transport
            .send(Destination::Session("s1".to_string()), json!({"a": 1}))
            .await;
        assert!(matches!(err, Err(TransportError::Closed)));
    }
}
