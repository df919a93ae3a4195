//! Authoritative in-memory catalog of tools, resources and prompts
//! (`spec.md` §4.4, §3 "Tool"/"Resource"). Read-mostly: lookups go through
//! `parking_lot::RwLock` shared guards, mutation (plugin load/unload) takes
//! the exclusive guard (`spec.md` §5 "shared resources").

use std::collections::BTreeMap;
use std::sync::Arc;

use discovery_protocol::schema::ParamDescriptor;
use discovery_protocol::types::{PromptDescriptor, ResourceDescriptor, Tool};
use parking_lot::RwLock;

use crate::error::ServerError;
use crate::runtime::{PromptRenderHandler, ResourceReadHandler, ToolHandler};

struct RegisteredTool {
    tool: Tool,
    /// The parameter list the tool's schema was built from, kept alongside
    /// the sanitized schema so `tools/call` can apply defaults against the
    /// pre-sanitization shape (`spec.md` §4.3).
    params: Vec<ParamDescriptor>,
    handler: Arc<dyn ToolHandler>,
    /// Which plugin registered this tool, for unload bookkeeping. `None`
    /// for built-in tools that ship with the server itself.
    owner: Option<String>,
}

struct RegisteredResource {
    descriptor: ResourceDescriptor,
    /// `readHandler` (`spec.md` §3 "Resource"), kept server-side rather
    /// than on the wire descriptor since it never serializes.
    handler: Arc<dyn ResourceReadHandler>,
}

struct RegisteredPrompt {
    descriptor: PromptDescriptor,
    handler: Arc<dyn PromptRenderHandler>,
}

/// What changed in the registry, passed to `onChange` listeners so the
/// engine can emit the matching `notifications/*/listChanged`
/// (`spec.md` §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A tool set changed.
    Tools,
    /// The resource table changed.
    Resources,
    /// The prompt table changed.
    Prompts,
}

/// A registry change listener. The engine registers one closure per
/// session that forwards to that session's transport.
pub type ChangeListener = Arc<dyn Fn(ChangeKind) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    entries: Vec<ChangeListener>,
}

/// The tool/resource/prompt catalog.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    resources: RwLock<BTreeMap<String, RegisteredResource>>,
    prompts: RwLock<BTreeMap<String, RegisteredPrompt>>,
    listeners: RwLock<Listeners>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            resources: RwLock::new(BTreeMap::new()),
            prompts: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Listeners::default()),
        }
    }

    /// Register a tool. Name collisions (even across plugins) are fatal
    /// (`spec.md` §3 invariant: "tool names are unique across all loaded
    /// plugins").
    pub fn register_tool(
        &self,
        tool: Tool,
        params: Vec<ParamDescriptor>,
        handler: Arc<dyn ToolHandler>,
        owner: Option<String>,
    ) -> Result<(), ServerError> {
        let mut tools = self.tools.write();
        if tools.contains_key(&tool.name) {
            return Err(ServerError::NameCollision { name: tool.name });
        }
        tools.insert(
            tool.name.clone(),
            RegisteredTool { tool, params, handler, owner },
        );
        drop(tools);
        self.notify(ChangeKind::Tools);
        Ok(())
    }

    /// Remove a tool by name.
    pub fn unregister_tool(&self, name: &str) -> Result<(), ServerError> {
        let removed = self.tools.write().remove(name);
        if removed.is_none() {
            return Err(ServerError::not_found(format!("tool '{name}'")));
        }
        self.notify(ChangeKind::Tools);
        Ok(())
    }

    /// Remove every tool owned by `plugin_id` (unload).
    pub fn unregister_plugin_tools(&self, plugin_id: &str) -> usize {
        let mut tools = self.tools.write();
        let before = tools.len();
        tools.retain(|_, entry| entry.owner.as_deref() != Some(plugin_id));
        let removed = before - tools.len();
        drop(tools);
        if removed > 0 {
            self.notify(ChangeKind::Tools);
        }
        removed
    }

    /// Look up a tool's descriptor, parameter list and handler by name.
    pub fn lookup(&self, name: &str) -> Option<(Tool, Vec<ParamDescriptor>, Arc<dyn ToolHandler>)> {
        self.tools
            .read()
            .get(name)
            .map(|entry| (entry.tool.clone(), entry.params.clone(), Arc::clone(&entry.handler)))
    }

    /// List tools, optionally filtered to one category.
    pub fn list_tools(&self, category: Option<&str>) -> Vec<Tool> {
        self.tools
            .read()
            .values()
            .filter(|entry| category.map_or(true, |c| entry.tool.category == c))
            .map(|entry| entry.tool.clone())
            .collect()
    }

    /// Register a static resource with its `readHandler`.
    pub fn register_resource(
        &self,
        resource: ResourceDescriptor,
        handler: Arc<dyn ResourceReadHandler>,
    ) -> Result<(), ServerError> {
        let mut resources = self.resources.write();
        if resources.contains_key(&resource.uri) {
            return Err(ServerError::NameCollision { name: resource.uri });
        }
        resources.insert(
            resource.uri.clone(),
            RegisteredResource { descriptor: resource, handler },
        );
        drop(resources);
        self.notify(ChangeKind::Resources);
        Ok(())
    }

    /// List all static resource descriptors.
    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.resources.read().values().map(|entry| entry.descriptor.clone()).collect()
    }

    /// Fetch one resource's descriptor and `readHandler` by uri.
    pub fn get_resource(&self, uri: &str) -> Option<(ResourceDescriptor, Arc<dyn ResourceReadHandler>)> {
        self.resources
            .read()
            .get(uri)
            .map(|entry| (entry.descriptor.clone(), Arc::clone(&entry.handler)))
    }

    /// Register a prompt template with its render handler.
    pub fn register_prompt(
        &self,
        prompt: PromptDescriptor,
        handler: Arc<dyn PromptRenderHandler>,
    ) -> Result<(), ServerError> {
        let mut prompts = self.prompts.write();
        if prompts.contains_key(&prompt.name) {
            return Err(ServerError::NameCollision { name: prompt.name });
        }
        prompts.insert(
            prompt.name.clone(),
            RegisteredPrompt { descriptor: prompt, handler },
        );
        drop(prompts);
        self.notify(ChangeKind::Prompts);
        Ok(())
    }

    /// List all prompt descriptors.
    pub fn list_prompts(&self) -> Vec<PromptDescriptor> {
        self.prompts.read().values().map(|entry| entry.descriptor.clone()).collect()
    }

    /// Fetch one prompt's descriptor and render handler by name.
    pub fn get_prompt(&self, name: &str) -> Option<(PromptDescriptor, Arc<dyn PromptRenderHandler>)> {
        self.prompts
            .read()
            .get(name)
            .map(|entry| (entry.descriptor.clone(), Arc::clone(&entry.handler)))
    }

    /// Register a listener invoked on every mutation.
    pub fn on_change(&self, listener: ChangeListener) {
        self.listeners.write().entries.push(listener);
    }

    fn notify(&self, kind: ChangeKind) {
        for listener in &self.listeners.read().entries {
            listener(kind);
        }
    }
}

impl discovery_transport::ToolCatalog for ToolRegistry {
    fn tool_count(&self) -> usize {
        self.tools.read().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use discovery_protocol::types::CallToolResult;
    use serde_json::{Value, json};

    use super::*;
    use crate::runtime::ToolInvocation;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, _invocation: ToolInvocation) -> CallToolResult {
            CallToolResult::text("ok")
        }
    }

    fn sample_tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: "test tool".to_string(),
            input_schema: json!({"type": "object", "properties": {}, "additionalProperties": false}),
            category: "test".to_string(),
        }
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let registry = ToolRegistry::new();
        registry
            .register_tool(sample_tool("ping"), Vec::new(), Arc::new(EchoHandler), None)
            .unwrap();
        assert!(registry.lookup("ping").is_some());
        assert_eq!(registry.list_tools(None).len(), 1);
    }

    #[test]
    fn lookup_returns_registered_params() {
        let registry = ToolRegistry::new();
        let params = vec![ParamDescriptor {
            name: "host".into(),
            description: "target host".into(),
            kind: discovery_protocol::schema::ParamKind::String { enum_values: None },
            required: true,
            default: None,
        }];
        registry
            .register_tool(sample_tool("ping"), params, Arc::new(EchoHandler), None)
            .unwrap();
        let (_, params, _) = registry.lookup("ping").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "host");
    }

    #[test]
    fn duplicate_name_is_collision() {
        let registry = ToolRegistry::new();
        registry
            .register_tool(sample_tool("ping"), Vec::new(), Arc::new(EchoHandler), None)
            .unwrap();
        let err = registry.register_tool(sample_tool("ping"), Vec::new(), Arc::new(EchoHandler), None);
        assert!(matches!(err, Err(ServerError::NameCollision { .. })));
    }

    #[test]
    fn unregister_plugin_tools_removes_only_owned() {
        let registry = ToolRegistry::new();
        registry
            .register_tool(sample_tool("builtin_ping"), Vec::new(), Arc::new(EchoHandler), None)
            .unwrap();
        registry
            .register_tool(
                sample_tool("plugin_scan"),
                Vec::new(),
                Arc::new(EchoHandler),
                Some("scanner-plugin".to_string()),
            )
            .unwrap();
        let removed = registry.unregister_plugin_tools("scanner-plugin");
        assert_eq!(removed, 1);
        assert!(registry.lookup("builtin_ping").is_some());
        assert!(registry.lookup("plugin_scan").is_none());
    }

    struct NullResourceHandler;
    #[async_trait]
    impl ResourceReadHandler for NullResourceHandler {
        async fn read(&self, uri: &str) -> Result<discovery_protocol::types::ResourceContents, ServerError> {
            Ok(discovery_protocol::types::ResourceContents {
                uri: uri.to_string(),
                mime_type: None,
                text: Some("ok".to_string()),
                blob: None,
            })
        }
    }

    #[tokio::test]
    async fn register_then_read_resource_round_trips() {
        let registry = ToolRegistry::new();
        registry
            .register_resource(
                ResourceDescriptor {
                    uri: "res://a".to_string(),
                    name: "A".to_string(),
                    mime_type: None,
                },
                Arc::new(NullResourceHandler),
            )
            .unwrap();
        let (descriptor, handler) = registry.get_resource("res://a").unwrap();
        assert_eq!(descriptor.name, "A");
        let contents = handler.read("res://a").await.unwrap();
        assert_eq!(contents.text.as_deref(), Some("ok"));
    }

    #[test]
    fn on_change_fires_for_tool_mutation() {
        let registry = ToolRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        registry.on_change(Arc::new(move |_kind| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        registry
            .register_tool(sample_tool("ping"), Vec::new(), Arc::new(EchoHandler), None)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
