//! Control-plane API surface, exercised through the router

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use serial_test::serial;
use tower::ServiceExt;

use fluxgate::config::GatewayConfig;
use fluxgate::middleware::control_auth_middleware;
use fluxgate::routes;
use fluxgate::state::AppState;

fn app(state_dir: &std::path::Path, control_token: Option<&str>) -> (Router, Arc<AppState>) {
    let mut config = GatewayConfig::default();
    config.state_dir = state_dir.to_path_buf();
    config.control_token = control_token.map(fluxgate::auth::Secret::new);
    let state = Arc::new(AppState::new(config));

    let router = routes::api::create_api_router()
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            control_auth_middleware,
        ))
        .route(
            "/",
            axum::routing::get(fluxgate::handlers::health::health_check),
        )
        .with_state(state.clone());
    (router, state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

const ENDPOINT_YAML: &str = "\
name: hooks
kind: http
port: 39331
pipeline:
  - tool: echo
    params:
      ok: true
    output: reply
";

#[tokio::test]
#[serial]
async fn create_list_delete_through_the_api() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = app(dir.path(), None);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/endpoints")
                .body(Body::from(ENDPOINT_YAML))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["endpoint"]["name"], json!("hooks"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/endpoints")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], json!(1));
    // Secrets never appear; auth is reported by kind only
    assert_eq!(body["endpoints"][0]["auth"], json!("none"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/endpoints/hooks?metrics=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("running"));
    assert!(body["metrics"].is_object());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/endpoints/hooks")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/endpoints/hooks")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
#[serial]
async fn invalid_config_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = app(dir.path(), None);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/endpoints")
                .body(Body::from("name: bad\nkind: http\nport: 0\n"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
#[serial]
async fn control_token_protects_management_routes() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = app(dir.path(), Some("admin-token"));

    let denied = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/endpoints")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let allowed = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/endpoints")
                .header("authorization", "Bearer admin-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    // Health stays public
    let health = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = body_json(health).await;
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
#[serial]
async fn broadcast_on_http_endpoint_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _state) = app(dir.path(), None);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/endpoints")
                .body(Body::from(ENDPOINT_YAML))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/endpoints/hooks/broadcast")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message": {"x": 1}}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/endpoints/hooks")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
