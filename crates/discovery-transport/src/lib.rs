//! Wire transports for the discovery MCP engine: stdio, streamable HTTP+SSE
//! and AMQP, all speaking the same narrow [`core::Transport`] contract
//! (`SPEC_FULL.md` §4.7). Module layout follows the teacher's
//! `turbomcp-transport` crate (one file per wire protocol, a shared
//! `core` module for the trait and error type).

#![warn(missing_docs, clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod amqp;
pub mod core;
pub mod http;
pub mod stdio;

pub use core::{
    Destination, InboundMessage, MessageSink, SessionHint, ToolCatalog, Transport,
    TransportConfig, TransportError, TransportKind, TransportMetrics,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::stdio::StdioTransport;

    struct CountingSink {
        messages: AtomicUsize,
    }

    #[async_trait]
    impl MessageSink for CountingSink {
        async fn on_message(&self, _transport: TransportKind, _message: InboundMessage) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_error(&self, _transport: TransportKind, _error: TransportError) {}
        async fn on_close(&self, _transport: TransportKind, _session: SessionHint) {}
    }

    #[tokio::test]
    async fn stdio_start_is_idempotent() {
        let transport = StdioTransport::new();
        let sink = Arc::new(CountingSink {
            messages: AtomicUsize::new(0),
        });
        assert!(transport.start(sink.clone()).await.is_ok());
        assert!(transport.start(sink).await.is_ok());
    }

    #[tokio::test]
    async fn stdio_send_after_close_fails() {
        let transport = StdioTransport::new();
        let sink = Arc::new(CountingSink {
            messages: AtomicUsize::new(0),
        });
        transport.start(sink).await.unwrap();
        transport.close().await.unwrap();
        let err = transport
            .send(Destination::Session("stdio".to_string()), json!({"a": 1}))
            .await;
        assert!(matches!(err, Err(TransportError::Closed)));
    }
}
