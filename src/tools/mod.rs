//! Tool registry
//!
//! Pipelines invoke tools through a registration table built at startup:
//! `name -> async (params) -> result`. The gateway never knows tool
//! internals. Resolution happens at invocation time, so a tool registered
//! late or removed only affects the specific invocation that names it.

pub mod builtin;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Result type for tool invocations
pub type ToolResult<T> = Result<T, ToolError>;

/// Error type for tool resolution and invocation
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    /// Name not present in the registration table
    #[error("Tool not found: {0}")]
    NotFound(String),

    /// Params did not match what the tool expects
    #[error("Invalid params for tool '{tool}': {message}")]
    InvalidParams { tool: String, message: String },

    /// Tool ran and failed
    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

impl ToolError {
    pub fn invalid_params(tool: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidParams {
            tool: tool.into(),
            message: message.to_string(),
        }
    }

    pub fn failed(tool: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}

/// A named, async callable invoked by pipeline steps
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Invoke with already-substituted params
    async fn invoke(&self, params: Value) -> ToolResult<Value>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Registration table mapping tool names to implementations.
///
/// Thread-safe; lookups are O(1). Injected by `Arc` into the call paths
/// that need it rather than held as a process-wide global.
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Create a registry preloaded with the builtin tool set
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        builtin::register_all(&registry);
        registry
    }

    /// Register a tool under its own name
    pub fn register(&self, tool: Arc<dyn Tool>) {
        debug!(tool = %tool.name(), "Registering tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Resolve a tool by name
    pub fn get(&self, name: &str) -> ToolResult<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Check if a tool is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Remove a tool
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name).map(|(_, v)| v)
    }

    /// All registered tool names
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl Tool for Doubler {
        fn name(&self) -> &str {
            "double"
        }

        async fn invoke(&self, params: Value) -> ToolResult<Value> {
            let n = params
                .get("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| ToolError::invalid_params("double", "missing numeric 'n'"))?;
            Ok(json!({"result": n * 2}))
        }
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Doubler));

        let tool = registry.get("double").unwrap();
        let out = tool.invoke(json!({"n": 3})).await.unwrap();
        assert_eq!(out, json!({"result": 6}));
    }

    #[test]
    fn test_unknown_tool_fails_fast() {
        let registry = ToolRegistry::new();
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.contains("echo"));
        assert!(registry.contains("word_stats"));
        assert!(registry.contains("json_extract"));
        assert!(registry.contains("http_request"));
    }
}
