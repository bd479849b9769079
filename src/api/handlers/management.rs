use crate::api::handlers::pool::ApiState;
use crate::api::types::HealthResponse;
use crate::rpc::{metrics, Dialer};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

/// GET /health - Health check endpoint
pub async fn health_check<D: Dialer>(
    State(state): State<ApiState<D>>,
) -> (StatusCode, Json<HealthResponse>) {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        pools: state.registry.addresses().len(),
    };

    (StatusCode::OK, Json(response))
}

/// GET /metrics - Prometheus metrics endpoint
pub async fn get_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
