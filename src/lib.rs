pub mod auth;
pub mod config;
pub mod endpoints;
pub mod errors;
pub mod expr;
pub mod handlers;
pub mod middleware;
pub mod pipeline;
pub mod registry;
pub mod routes;
pub mod state;
pub mod tools;

// Re-export commonly used items for convenience
pub use config::{EndpointConfig, EndpointKind, GatewayConfig};
pub use errors::auth_error::{AuthError, AuthResult};
pub use errors::gateway_error::{GatewayError, GatewayResult};
pub use registry::EndpointRegistry;
pub use state::AppState;
pub use tools::{Tool, ToolRegistry};
