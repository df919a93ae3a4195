//! Session lifecycle (`spec.md` §4.2, §3 "Session"): opaque ids, protocol
//! version negotiation, idle TTL, per-request cancellation handles. Kept as
//! an explicit `SessionManager` value built at startup rather than a
//! singleton (`spec.md` §9 "global mutable state... expressed as an
//! explicit Server value"), in the same spirit as the teacher's
//! `ServerState` construction in `turbomcp-server::server`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use discovery_protocol::types::{Implementation, negotiate_protocol_version};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ServerError;

/// A session's place in its lifecycle (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, `initialize` answered, awaiting `notifications/initialized`.
    Init,
    /// Ready to receive/emit notifications.
    Ready,
    /// Terminated; kept in the map briefly for 404-vs-reuse diagnostics,
    /// then swept.
    Closed,
}

/// Which transport a session lives on, to scope transport-specific
/// behavior (e.g. only HTTP sessions carry an SSE cursor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransport {
    /// Stdio: exactly one implicit session per process.
    Stdio,
    /// Streamable HTTP + SSE.
    Http,
    /// AMQP request/reply.
    Amqp,
}

/// One client conversation (`spec.md` §3 "Session").
pub struct Session {
    /// Opaque, unguessable session identifier.
    pub id: String,
    /// Which transport this session was created on.
    pub transport: SessionTransport,
    /// Negotiated MCP protocol version.
    pub protocol_version: String,
    /// `clientInfo` supplied at `initialize`.
    pub client_info: Implementation,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time this session was touched by a request.
    pub last_activity_at: DateTime<Utc>,
    /// Cancellation handles for in-flight requests, keyed by request id
    /// rendered as a string.
    pub pending_requests: HashMap<String, CancellationToken>,
    /// Last SSE event id delivered, for `Last-Event-ID` bookkeeping
    /// (HTTP sessions only).
    pub sse_last_event_id: Option<u64>,
}

impl Session {
    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Owns every live session. Readers/writers both go through `DashMap`'s
/// per-shard locking, matching the registry's read-mostly access pattern
/// (`spec.md` §5 "shared resources").
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    idle_ttl: Duration,
}

impl SessionManager {
    /// Build a manager with the given idle TTL (`spec.md` §6
    /// `HTTP_SESSION_TTL_SECONDS`, default 1800s / 30min per §4.2).
    #[must_use]
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl,
        }
    }

    /// Create a new `Init`-state session under a freshly generated id,
    /// negotiating the protocol version against the client's requested one.
    /// Used by transports (like stdio) that have no session id of their own.
    pub fn create(
        &self,
        transport: SessionTransport,
        requested_protocol_version: &str,
        client_info: Implementation,
    ) -> Result<Arc<str>, ServerError> {
        let id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        self.create_with_id(id.to_string(), transport, requested_protocol_version, client_info)?;
        Ok(id)
    }

    /// Create a new `Init`-state session under a caller-supplied id. Used
    /// by HTTP/AMQP, which assign the session id at the transport layer
    /// (HTTP: `Mcp-Session-Id` generated before `initialize` is dispatched;
    /// AMQP: the first `initialize` correlation id) so the transport's and
    /// the engine's notion of "this session" stay the same identifier.
    pub fn create_with_id(
        &self,
        id: impl Into<String>,
        transport: SessionTransport,
        requested_protocol_version: &str,
        client_info: Implementation,
    ) -> Result<(), ServerError> {
        let negotiated = negotiate_protocol_version(requested_protocol_version).ok_or_else(|| {
            ServerError::invalid_params(format!(
                "unsupported protocol version: {requested_protocol_version}"
            ))
        })?;

        let id = id.into();
        let now = Utc::now();
        self.sessions.insert(
            id.clone(),
            Session {
                id,
                transport,
                protocol_version: negotiated.to_string(),
                client_info,
                state: SessionState::Init,
                created_at: now,
                last_activity_at: now,
                pending_requests: HashMap::new(),
                sse_last_event_id: None,
            },
        );
        Ok(())
    }

    /// Mark a session `Ready` on `notifications/initialized`.
    pub fn mark_ready(&self, id: &str) -> Result<(), ServerError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| ServerError::UnknownSession {
                session_id: id.to_string(),
            })?;
        entry.state = SessionState::Ready;
        entry.touch();
        Ok(())
    }

    /// Resolve a session for an ordinary (non-`initialize`) request,
    /// touching its activity timestamp and rejecting stale/closed/unknown
    /// ids uniformly (`spec.md` §4.2 "missing session on any non-initialize
    /// HTTP request -> 404").
    pub fn touch(&self, id: &str) -> Result<(), ServerError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| ServerError::UnknownSession {
                session_id: id.to_string(),
            })?;
        if entry.state == SessionState::Closed {
            return Err(ServerError::UnknownSession {
                session_id: id.to_string(),
            });
        }
        if Utc::now().signed_duration_since(entry.last_activity_at)
            > chrono::Duration::from_std(self.idle_ttl).unwrap_or(chrono::Duration::zero())
        {
            entry.state = SessionState::Closed;
            return Err(ServerError::UnknownSession {
                session_id: id.to_string(),
            });
        }
        entry.touch();
        Ok(())
    }

    /// Register a cancellation handle for an in-flight request.
    pub fn register_request(&self, session_id: &str, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.pending_requests.insert(request_id.to_string(), token.clone());
        }
        token
    }

    /// A reply was sent (or the request failed) — drop its cancellation
    /// handle.
    pub fn complete_request(&self, session_id: &str, request_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.pending_requests.remove(request_id);
        }
    }

    /// Cancel an in-flight request (`notifications/cancelled`,
    /// `spec.md` §5).
    pub fn cancel_request(&self, session_id: &str, request_id: &str) -> bool {
        if let Some(entry) = self.sessions.get(session_id) {
            if let Some(token) = entry.pending_requests.get(request_id) {
                token.cancel();
                return true;
            }
        }
        false
    }

    /// Terminate a session explicitly (`DELETE`/logout) or because its
    /// transport disconnected, cancelling everything still in flight.
    pub fn close(&self, id: &str) {
        if let Some((_, mut session)) = self.sessions.remove(id) {
            for (_, token) in session.pending_requests.drain() {
                token.cancel();
            }
            session.state = SessionState::Closed;
        }
    }

    /// Sweep sessions idle past the TTL. Intended to run on a periodic
    /// background task; returns the ids it closed, for logging.
    pub fn sweep_expired(&self) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idle_ttl).unwrap_or(chrono::Duration::zero());
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_activity_at < cutoff)
            .map(|entry| entry.id.clone())
            .collect();
        for id in &expired {
            self.close(id);
        }
        expired
    }

    /// Number of live (non-closed) sessions, for `GET /health`.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Negotiated protocol version for a session, if it exists.
    pub fn protocol_version(&self, id: &str) -> Option<String> {
        self.sessions.get(id).map(|s| s.protocol_version.clone())
    }

    /// Record the last SSE event id delivered on a session, for
    /// `Last-Event-ID` resumability bookkeeping.
    pub fn record_sse_cursor(&self, id: &str, event_id: u64) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.sse_last_event_id = Some(event_id);
        }
    }

    /// Spawn the background idle-TTL sweeper. Intended to be called once
    /// at server startup.
    pub fn spawn_ttl_sweeper(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = manager.sweep_expired();
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "swept idle sessions");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_info() -> Implementation {
        Implementation {
            name: "test-client".to_string(),
            version: "0.0.0".to_string(),
        }
    }

    #[test]
    fn create_negotiates_protocol_version() {
        let manager = SessionManager::new(Duration::from_secs(1800));
        let id = manager.create(SessionTransport::Http, "2025-03-26", client_info()).unwrap();
        assert!(manager.touch(&id).is_ok());
    }

    #[test]
    fn unknown_protocol_version_negotiates_down_to_newest_supported() {
        let manager = SessionManager::new(Duration::from_secs(1800));
        let id = manager.create(SessionTransport::Http, "1999-01-01", client_info()).unwrap();
        assert!(manager.touch(&id).is_ok());
    }

    #[test]
    fn touch_on_unknown_session_is_unknown_session_error() {
        let manager = SessionManager::new(Duration::from_secs(1800));
        let err = manager.touch("does-not-exist").unwrap_err();
        assert!(matches!(err, ServerError::UnknownSession { .. }));
    }

    #[test]
    fn close_cancels_pending_requests() {
        let manager = SessionManager::new(Duration::from_secs(1800));
        let id = manager.create(SessionTransport::Stdio, "2025-06-18", client_info()).unwrap();
        let token = manager.register_request(&id, "42");
        manager.close(&id);
        assert!(token.is_cancelled());
        assert!(manager.touch(&id).is_err());
    }

    #[test]
    fn sweep_closes_idle_sessions() {
        let manager = SessionManager::new(Duration::from_millis(0));
        let id = manager.create(SessionTransport::Http, "2025-06-18", client_info()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let expired = manager.sweep_expired();
        assert_eq!(expired, vec![id.to_string()]);
    }
}
