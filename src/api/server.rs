use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::handlers::{get_metrics, get_pool_status, health_check, remove_pools, ApiState};
use crate::config::ApiSettings;
use crate::rpc::{Dialer, PoolRegistry};
use crate::utils::error::{GatewayError, Result};

/// Build the admin router
pub fn build_router<D: Dialer>(state: ApiState<D>) -> Router {
    Router::new()
        // Health and metrics
        .route("/health", get(health_check::<D>))
        .route("/metrics", get(get_metrics))
        // Pool diagnostics and discovery hook
        .route("/api/pool/status", get(get_pool_status::<D>))
        .route("/api/pool/remove", post(remove_pools::<D>))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the admin API server in the background
pub async fn start_api_server<D: Dialer>(
    settings: &ApiSettings,
    registry: Arc<PoolRegistry<D>>,
) -> Result<Option<JoinHandle<()>>> {
    if !settings.enabled {
        info!("API server disabled");
        return Ok(None);
    }

    let addr: SocketAddr = format!("{}:{}", settings.bind_address, settings.bind_port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("Invalid API bind address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(ApiState::new(registry));

    info!("API server listening on http://{}", local_addr);

    let server = axum::serve(listener, router.into_make_service());
    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("API server error: {}", err);
        }
    });

    Ok(Some(handle))
}
