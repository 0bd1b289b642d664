//! Registry lifecycle: start, replace, stop, persistence, restore

use std::sync::Arc;

use serde_json::json;
use serial_test::serial;

use fluxgate::config::{EndpointConfig, EndpointKind};
use fluxgate::registry::EndpointRegistry;
use fluxgate::tools::ToolRegistry;
use fluxgate::GatewayError;

fn registry(dir: &std::path::Path) -> EndpointRegistry {
    EndpointRegistry::new(dir, Arc::new(ToolRegistry::with_builtins()))
}

fn http_config(name: &str, port: u16) -> EndpointConfig {
    let mut config = EndpointConfig::new(name, EndpointKind::Http);
    config.port = port;
    config
}

#[tokio::test]
#[serial]
async fn start_list_stop_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());

    let summary = registry.start(http_config("hooks", 39301)).await.unwrap();
    assert_eq!(summary["name"], json!("hooks"));
    assert_eq!(summary["status"], json!("running"));

    let listed = registry.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["kind"], json!("http"));

    // Persisted under the per-kind directory
    assert!(dir.path().join("webhook/hooks.json").exists());

    let status = registry.status("hooks", true, false).await.unwrap();
    assert_eq!(status["metrics"]["requests"], json!(0));

    registry.stop("hooks").await.unwrap();
    assert!(registry.list().await.is_empty());
    assert!(!dir.path().join("webhook/hooks.json").exists());
}

#[tokio::test]
#[serial]
async fn replacement_frees_the_port() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());

    let mut first = http_config("hooks", 39302);
    first.response_template = Some(json!({"version": 1}));
    registry.start(first).await.unwrap();

    // Same name, same port: must stop the old listener before binding
    let mut second = http_config("hooks", 39302);
    second.response_template = Some(json!({"version": 2}));
    registry.start(second).await.unwrap();

    assert_eq!(registry.list().await.len(), 1);

    let response = reqwest::get("http://127.0.0.1:39302/").await.unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, json!({"version": 2}));

    registry.stop("hooks").await.unwrap();
}

#[tokio::test]
#[serial]
async fn bind_conflict_yields_no_entry() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());

    registry.start(http_config("first", 39303)).await.unwrap();
    let err = registry
        .start(http_config("second", 39303))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BindError { .. }));

    // The failed endpoint is neither registered nor persisted
    assert_eq!(registry.list().await.len(), 1);
    assert!(!dir.path().join("webhook/second.json").exists());

    registry.stop("first").await.unwrap();
}

#[tokio::test]
#[serial]
async fn restore_brings_endpoints_back() {
    let dir = tempfile::tempdir().unwrap();

    {
        let registry = registry(dir.path());
        let mut config = http_config("hooks", 39304);
        config.response_template = Some(json!({"restored": true}));
        registry.start(config).await.unwrap();
        // Shutdown keeps the persisted config
        registry.shutdown_all().await;
    }

    let registry = registry(dir.path());
    assert_eq!(registry.restore_all().await, 1);

    let response = reqwest::get("http://127.0.0.1:39304/").await.unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, json!({"restored": true}));

    // restore_all is once per process; a second call is a no-op
    assert_eq!(registry.restore_all().await, 1);

    registry.stop("hooks").await.unwrap();
}

#[tokio::test]
#[serial]
async fn restore_skips_and_deletes_corrupt_configs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("webhook")).unwrap();
    let corrupt = dir.path().join("webhook/broken.json");
    std::fs::write(&corrupt, b"{ not json").unwrap();

    let registry = registry(dir.path());
    assert_eq!(registry.restore_all().await, 0);
    assert!(!corrupt.exists());
}

#[tokio::test]
#[serial]
async fn restore_deletes_configs_that_fail_to_start() {
    let dir = tempfile::tempdir().unwrap();

    // One healthy endpoint plus a parseable config that cannot start
    // (port 0 fails validation); the latter's file is removed on restore
    {
        let registry = registry(dir.path());
        registry.start(http_config("keeper", 39305)).await.unwrap();
        registry.shutdown_all().await;
    }
    let stale = {
        let config = EndpointConfig::new("stale", EndpointKind::Http);
        let store = fluxgate::config::store::ConfigStore::new(dir.path());
        store.save(&config).unwrap();
        dir.path().join("webhook/stale.json")
    };

    let registry = registry(dir.path());
    let restored = registry.restore_all().await;
    assert_eq!(restored, 1);
    assert!(!stale.exists());
    assert!(dir.path().join("webhook/keeper.json").exists());

    registry.stop("keeper").await.unwrap();
}
