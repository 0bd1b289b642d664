//! Health check handler

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

/// `GET /` - liveness probe plus a coarse endpoint count
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let endpoints = state.registry.list().await.len();
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": endpoints,
    }))
}
