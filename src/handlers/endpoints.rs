//! Control-plane endpoint management handlers

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::EndpointConfig;
use crate::endpoints::BroadcastFilter;
use crate::errors::gateway_error::{GatewayError, GatewayResult};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub metrics: bool,
    #[serde(default)]
    pub connections: bool,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub message: Value,
    #[serde(default)]
    pub filter: BroadcastFilter,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub message: Value,
}

/// `POST /endpoints` - start an endpoint from a JSON or YAML config body.
///
/// Starting a name that already exists replaces it.
pub async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    body: String,
) -> GatewayResult<Response> {
    let config = EndpointConfig::parse(&body).map_err(GatewayError::Config)?;
    let summary = state.registry.start(config).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "endpoint": summary})),
    )
        .into_response())
}

/// `DELETE /endpoints/{name}` - stop an endpoint and forget its config
pub async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> GatewayResult<Json<Value>> {
    state.registry.stop(&name).await?;
    Ok(Json(json!({"success": true, "name": name})))
}

/// `GET /endpoints` - list all endpoints, secrets masked
pub async fn list_endpoints(State(state): State<Arc<AppState>>) -> Json<Value> {
    let endpoints = state.registry.list().await;
    Json(json!({"count": endpoints.len(), "endpoints": endpoints}))
}

/// `GET /endpoints/{name}?metrics=true&connections=true`
pub async fn get_endpoint(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<StatusQuery>,
) -> GatewayResult<Json<Value>> {
    let status = state
        .registry
        .status(&name, query.metrics, query.connections)
        .await?;
    Ok(Json(status))
}

/// `POST /endpoints/{name}/test` - deliver a payload through the endpoint's
/// real network path
pub async fn test_endpoint(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(payload): Json<Value>,
) -> GatewayResult<Json<Value>> {
    let result = state.registry.test(&name, payload).await?;
    Ok(Json(json!({"success": true, "test": result})))
}

/// `POST /endpoints/{name}/broadcast` - fan a message out to ws-server
/// clients matching the filter
pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<BroadcastRequest>,
) -> GatewayResult<Json<Value>> {
    let outcome = state
        .registry
        .broadcast(&name, request.message, request.filter)
        .await?;
    Ok(Json(json!({"success": true, "result": outcome})))
}

/// `POST /endpoints/{name}/send` - push a message through a ws-client's
/// live connection
pub async fn send(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<SendRequest>,
) -> GatewayResult<Json<Value>> {
    state.registry.client_send(&name, request.message).await?;
    Ok(Json(json!({"success": true})))
}
