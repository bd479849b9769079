/// Admin API Tests
///
/// Drives the admin router in-process with `tower::ServiceExt::oneshot`.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::FakeDialer;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tradegate::api::build_router;
use tradegate::api::handlers::ApiState;
use tradegate::rpc::{PoolOptions, PoolRegistry, RegistryConfig};

fn test_registry() -> Arc<PoolRegistry<FakeDialer>> {
    let config = RegistryConfig {
        pool: PoolOptions {
            max_idle: 1,
            max_active: 2,
            max_concurrent_streams: 1,
            reuse: true,
        },
        leak_sweep_interval: Duration::from_secs(3600),
        leak_threshold: Duration::from_secs(3600),
        ..Default::default()
    };
    Arc::new(PoolRegistry::new(config, FakeDialer::new()))
}

fn router(registry: &Arc<PoolRegistry<FakeDialer>>) -> Router {
    build_router(ApiState::new(registry.clone()))
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_counts_pools() {
    let registry = test_registry();
    registry.get_conn("10.3.0.1:9000").await.unwrap();

    let response = router(&registry)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["pools"], 1);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn metrics_are_plain_text() {
    let registry = test_registry();
    registry.get_conn("10.3.0.2:9000").await.unwrap();

    let response = router(&registry)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let text = String::from_utf8(
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap();
    if cfg!(feature = "metrics") {
        assert!(text.contains("tradegate_pool_connections_dialed_total"));
    }
}

#[tokio::test]
async fn status_defaults_to_all_pools() {
    let registry = test_registry();
    let _lease = registry.get_conn("10.3.0.3:9000").await.unwrap();
    registry.get_conn("10.3.0.4:9000").await.unwrap();

    let response = router(&registry)
        .oneshot(Request::get("/api/pool/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body.as_object().unwrap().len(), 2);
    assert_eq!(body["10.3.0.3:9000"]["ref"], 1);
    assert_eq!(body["10.3.0.4:9000"]["current"], 1);
}

#[tokio::test]
async fn status_of_single_pool() {
    let registry = test_registry();
    registry.get_conn("10.3.0.5:9000").await.unwrap();

    let response = router(&registry)
        .oneshot(
            Request::get("/api/pool/status?target=10.3.0.5:9000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["address"], "10.3.0.5:9000");
    assert_eq!(body["status"], "ready");
    assert_eq!(body["options"]["max_active"], 2);
}

#[tokio::test]
async fn status_of_unknown_pool_is_not_found() {
    let registry = test_registry();

    let response = router(&registry)
        .oneshot(
            Request::get("/api/pool/status?target=10.3.9.9:1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("10.3.9.9:1"));
}

#[tokio::test]
async fn remove_endpoint_retires_pools() {
    let registry = test_registry();
    registry.get_conn("10.3.1.1:9000").await.unwrap();
    registry.get_conn("10.3.1.2:9000").await.unwrap();
    let removed_pool = registry.pool("10.3.1.1:9000").unwrap();

    let request = Request::post("/api/pool/remove")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "addresses": ["10.3.1.1:9000", "10.3.9.9:1"] }).to_string(),
        ))
        .unwrap();
    let response = router(&registry).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["removed"], json!(["10.3.1.1:9000"]));
    assert!(removed_pool.is_closed());
    assert_eq!(registry.addresses(), vec!["10.3.1.2:9000".to_string()]);
}

#[tokio::test]
async fn remove_rejects_malformed_body() {
    let registry = test_registry();

    let request = Request::post("/api/pool/remove")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"hosts": []}"#))
        .unwrap();
    let response = router(&registry).oneshot(request).await.unwrap();

    assert!(response.status().is_client_error());
}
