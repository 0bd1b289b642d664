//! Shared application state for the control-plane server

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::registry::EndpointRegistry;
use crate::tools::ToolRegistry;

/// State injected into every control-plane handler
pub struct AppState {
    pub config: GatewayConfig,
    pub registry: EndpointRegistry,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let tools = Arc::new(ToolRegistry::with_builtins());
        let registry = EndpointRegistry::new(&config.state_dir, tools);
        Self { config, registry }
    }

    /// State with a caller-provided tool registry
    pub fn with_tools(config: GatewayConfig, tools: Arc<ToolRegistry>) -> Self {
        let registry = EndpointRegistry::new(&config.state_dir, tools);
        Self { config, registry }
    }
}
