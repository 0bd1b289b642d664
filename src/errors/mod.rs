pub mod auth_error;
pub mod gateway_error;

pub use auth_error::{AuthError, AuthResult};
pub use gateway_error::{GatewayError, GatewayResult};
