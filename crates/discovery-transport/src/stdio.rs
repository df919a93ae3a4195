//! Newline-delimited JSON over stdin/stdout (`spec.md` §4.7.1): one implicit
//! session, backpressure is standard pipe buffering, writes are serialized
//! behind a single mutex. Interior-mutability split follows the teacher's
//! stdio transport
//! (`examples/Epistates-turbomcp/crates/turbomcp-transport/src/stdio.rs`):
//! plain state behind `std::sync::Mutex`, I/O streams behind
//! `tokio::sync::Mutex` because they're held across `.await`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{BufReader, Stdin, Stdout, stdin, stdout};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::core::{
    Destination, InboundMessage, MessageSink, SessionHint, Transport, TransportError,
    TransportKind, TransportMetrics,
};

type StdinReader = FramedRead<BufReader<Stdin>, LinesCodec>;
type StdoutWriter = FramedWrite<Stdout, LinesCodec>;

/// The one implicit stdio session id, handed to the engine as `SessionHint`
/// even though no wire header ever carries it.
pub const STDIO_SESSION: &str = "stdio";

/// Stdio transport. `start()` spawns the read loop; `send()`/`close()` are
/// safe to call from any task once started.
pub struct StdioTransport {
    started: StdMutex<bool>,
    writer: Arc<TokioMutex<Option<StdoutWriter>>>,
    messages_in: Arc<AtomicU64>,
    messages_out: AtomicU64,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioTransport {
    /// Build a stdio transport bound to the process's real stdin/stdout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: StdMutex::new(false),
            writer: Arc::new(TokioMutex::new(None)),
            messages_in: Arc::new(AtomicU64::new(0)),
            messages_out: AtomicU64::new(0),
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn start(&self, sink: Arc<dyn MessageSink>) -> Result<(), TransportError> {
        {
            let mut started = self.started.lock().expect("stdio state mutex poisoned");
            if *started {
                return Ok(());
            }
            *started = true;
        }

        let mut reader: StdinReader = FramedRead::new(BufReader::new(stdin()), LinesCodec::new());
        *self.writer.lock().await = Some(FramedWrite::new(stdout(), LinesCodec::new()));

        let closed = Arc::clone(&self.closed);
        let messages_in = Arc::clone(&self.messages_in);
        tokio::spawn(async move {
            while let Some(line) = reader.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        sink.on_error(TransportKind::Stdio, TransportError::Io(err.to_string()))
                            .await;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(payload) => {
                        messages_in.fetch_add(1, Ordering::Relaxed);
                        sink.on_message(
                            TransportKind::Stdio,
                            InboundMessage {
                                session: SessionHint::Id(STDIO_SESSION.to_string()),
                                payload,
                            },
                        )
                        .await;
                    }
                    Err(err) => {
                        sink.on_error(
                            TransportKind::Stdio,
                            TransportError::Protocol(format!("invalid JSON: {err}")),
                        )
                        .await;
                    }
                }
            }
            closed.store(true, Ordering::SeqCst);
            sink.on_close(TransportKind::Stdio, SessionHint::Id(STDIO_SESSION.to_string()))
                .await;
            debug!("stdio transport: stdin closed");
        });

        Ok(())
    }

    async fn send(&self, _to: Destination, message: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let line = serde_json::to_string(&message)
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
        if line.contains('\n') || line.contains('\r') {
            // serde_json never emits raw newlines, but guard the stdio framing
            // invariant explicitly since a violation here corrupts the stream.
            warn!("stdio outbound message contained an embedded newline; rejecting");
            return Err(TransportError::Protocol(
                "outbound message contains embedded newline".to_string(),
            ));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer
            .send(line)
            .await
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.writer.lock().await = None;
        Ok(())
    }

    async fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            messages_in: self.messages_in.load(std::sync::atomic::Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            active_sessions: u64::from(!self.closed.load(Ordering::SeqCst)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn send_before_start_is_closed() {
        let transport = StdioTransport::new();
        let err = transport
            .send(Destination::Session(STDIO_SESSION.to_string()), json!({"a": 1}))
            .await;
        assert!(matches!(err, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn metrics_before_start_reports_one_active_session() {
        let transport = StdioTransport::new();
        let metrics = transport.metrics().await;
        assert_eq!(metrics.messages_in, 0);
        assert_eq!(metrics.active_sessions, 1);
    }
}
