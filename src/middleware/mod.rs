pub mod auth;

pub use auth::control_auth_middleware;
