//! Built-in tools registered at startup, outside the plugin system
//! (`owner: None` in [`crate::registry::ToolRegistry`]). Exercises the same
//! runtime every plugin tool goes through: `ping` is subprocess-backed
//! (`spec.md` §4.5 scenario A), `memory_stats` is in-process and reads the
//! CMDB (scenario E).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use discovery_cmdb::Store;
use discovery_protocol::schema::{ParamDescriptor, ParamKind, build_schema};
use discovery_protocol::types::{
    CallToolResult, ContentItem, PromptDescriptor, PromptMessage, ResourceContents,
    ResourceDescriptor, Tool,
};
use serde_json::Value;

use crate::error::ServerError;
use crate::registry::ToolRegistry;
use crate::runtime::{
    PromptRenderHandler, ResourceReadHandler, SubprocessHandler, ToolHandler, ToolInvocation,
    sanitize,
};

fn ping_params() -> Vec<ParamDescriptor> {
    vec![
        ParamDescriptor {
            name: "host".to_string(),
            description: "hostname or IP address to probe".to_string(),
            kind: ParamKind::String { enum_values: None },
            required: true,
            default: None,
        },
        ParamDescriptor {
            name: "count".to_string(),
            description: "number of echo requests to send".to_string(),
            kind: ParamKind::Number {
                minimum: Some(1.0),
                maximum: Some(10.0),
            },
            required: false,
            default: Some(Value::from(4)),
        },
    ]
}

fn ping_tool() -> Tool {
    let params = ping_params();
    Tool {
        name: "network_ping".to_string(),
        description: "Send ICMP echo requests to a host and report round-trip results".to_string(),
        input_schema: build_schema(&params),
        category: "network".to_string(),
    }
}

fn ping_handler() -> Arc<dyn ToolHandler> {
    Arc::new(SubprocessHandler {
        program: "ping".to_string(),
        argv_builder: Box::new(|args: &BTreeMap<String, Value>| {
            let host = args
                .get("host")
                .and_then(Value::as_str)
                .ok_or_else(|| "host is required".to_string())?;
            if !sanitize::is_valid_hostname(host) {
                return Err(format!("'{host}' is not a valid hostname"));
            }
            let count = args.get("count").and_then(Value::as_u64).unwrap_or(4).clamp(1, 10);
            Ok(vec!["-c".to_string(), count.to_string(), host.to_string()])
        }),
        timeout_override: None,
    })
}

struct MemoryStatsHandler {
    store: Arc<Store>,
}

#[async_trait]
impl ToolHandler for MemoryStatsHandler {
    async fn call(&self, _invocation: ToolInvocation) -> CallToolResult {
        match self.store.stats().await {
            Ok(stats) => CallToolResult::text(
                serde_json::json!({
                    "ciCount": stats.ci_count,
                    "relationshipCount": stats.relationship_count,
                    "credentialCount": stats.credential_count,
                })
                .to_string(),
            ),
            Err(err) => CallToolResult::error(format!("failed to read CMDB stats: {err}")),
        }
    }
}

fn memory_stats_tool() -> Tool {
    Tool {
        name: "cmdb_memory_stats".to_string(),
        description: "Report row counts for every CMDB table".to_string(),
        input_schema: build_schema(&[]),
        category: "cmdb".to_string(),
    }
}

struct CmdbStatsResourceHandler {
    store: Arc<Store>,
}

#[async_trait]
impl ResourceReadHandler for CmdbStatsResourceHandler {
    async fn read(&self, uri: &str) -> Result<ResourceContents, ServerError> {
        let stats = self
            .store
            .stats()
            .await
            .map_err(|err| ServerError::internal(format!("failed to read CMDB stats: {err}")))?;
        let body = serde_json::json!({
            "ciCount": stats.ci_count,
            "relationshipCount": stats.relationship_count,
            "credentialCount": stats.credential_count,
        });
        Ok(ResourceContents {
            uri: uri.to_string(),
            mime_type: Some("application/json".to_string()),
            text: Some(body.to_string()),
            blob: None,
        })
    }
}

fn cmdb_stats_resource() -> ResourceDescriptor {
    ResourceDescriptor {
        uri: "cmdb://stats".to_string(),
        name: "CMDB statistics".to_string(),
        mime_type: Some("application/json".to_string()),
    }
}

struct DiscoverySummaryPromptHandler {
    store: Arc<Store>,
}

#[async_trait]
impl PromptRenderHandler for DiscoverySummaryPromptHandler {
    async fn render(
        &self,
        _name: &str,
        _arguments: &BTreeMap<String, Value>,
    ) -> Result<Vec<PromptMessage>, ServerError> {
        let stats = self
            .store
            .stats()
            .await
            .map_err(|err| ServerError::internal(format!("failed to read CMDB stats: {err}")))?;
        let summary = format!(
            "The CMDB currently tracks {} configuration items and {} relationships.",
            stats.ci_count, stats.relationship_count,
        );
        Ok(vec![PromptMessage {
            role: "user".to_string(),
            content: ContentItem::text(summary),
        }])
    }
}

fn discovery_summary_prompt() -> PromptDescriptor {
    PromptDescriptor {
        name: "discovery_summary".to_string(),
        description: Some("Summarize the current state of the CMDB".to_string()),
        input_schema: build_schema(&[]),
    }
}

/// Register every built-in tool, resource and prompt against `registry`.
pub fn register_all(registry: &ToolRegistry, store: Arc<Store>) -> Result<(), ServerError> {
    registry.register_tool(ping_tool(), ping_params(), ping_handler(), None)?;
    registry.register_tool(
        memory_stats_tool(),
        Vec::new(),
        Arc::new(MemoryStatsHandler { store: Arc::clone(&store) }),
        None,
    )?;
    registry.register_resource(
        cmdb_stats_resource(),
        Arc::new(CmdbStatsResourceHandler { store: Arc::clone(&store) }),
    )?;
    registry.register_prompt(
        discovery_summary_prompt(),
        Arc::new(DiscoverySummaryPromptHandler { store }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn memory_stats_reports_empty_counts() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let handler = MemoryStatsHandler { store };
        let result = handler
            .call(ToolInvocation {
                tool_name: "cmdb_memory_stats".to_string(),
                args: BTreeMap::new(),
                cancellation: CancellationToken::new(),
            })
            .await;
        assert!(!result.is_error);
    }

    #[test]
    fn ping_tool_registers_without_collision() {
        let registry = ToolRegistry::new();
        registry
            .register_tool(ping_tool(), ping_params(), ping_handler(), None)
            .unwrap();
        assert!(registry.lookup("network_ping").is_some());
    }

    #[tokio::test]
    async fn cmdb_stats_resource_reads_live_counts() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let handler = CmdbStatsResourceHandler { store };
        let contents = handler.read("cmdb://stats").await.unwrap();
        assert_eq!(contents.uri, "cmdb://stats");
        assert!(contents.text.unwrap().contains("ciCount"));
    }

    #[tokio::test]
    async fn discovery_summary_prompt_renders_one_message() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let handler = DiscoverySummaryPromptHandler { store };
        let messages = handler.render("discovery_summary", &BTreeMap::new()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn register_all_registers_resource_and_prompt() {
        let registry = ToolRegistry::new();
        let store = Arc::new(Store::in_memory().await.unwrap());
        register_all(&registry, store).unwrap();
        assert!(registry.get_resource("cmdb://stats").is_some());
        assert!(registry.get_prompt("discovery_summary").is_some());
    }
}
