//! Control-plane API router
//!
//! Auth middleware is applied in main.rs once the shared state exists; the
//! health route stays outside it.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers::endpoints;
use crate::state::AppState;

/// Routes protected by the control token
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/endpoints",
            get(endpoints::list_endpoints).post(endpoints::create_endpoint),
        )
        .route(
            "/endpoints/{name}",
            get(endpoints::get_endpoint).delete(endpoints::delete_endpoint),
        )
        .route("/endpoints/{name}/test", post(endpoints::test_endpoint))
        .route("/endpoints/{name}/broadcast", post(endpoints::broadcast))
        .route("/endpoints/{name}/send", post(endpoints::send))
        .layer(TraceLayer::new_for_http())
}
