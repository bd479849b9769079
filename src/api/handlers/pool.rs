use crate::api::types::{
    ErrorResponse, PoolStatusQuery, PoolStatusResponse, RemovePoolsRequest, RemovePoolsResponse,
};
use crate::rpc::{Dialer, PoolRegistry, STATUS_ALL};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// API state containing shared resources
pub struct ApiState<D: Dialer> {
    pub registry: Arc<PoolRegistry<D>>,
    pub start_time: Instant,
}

impl<D: Dialer> ApiState<D> {
    pub fn new(registry: Arc<PoolRegistry<D>>) -> Self {
        Self {
            registry,
            start_time: Instant::now(),
        }
    }
}

impl<D: Dialer> Clone for ApiState<D> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            start_time: self.start_time,
        }
    }
}

/// GET /api/pool/status?target=<address|all> - pool diagnostics
pub async fn get_pool_status<D: Dialer>(
    State(state): State<ApiState<D>>,
    Query(query): Query<PoolStatusQuery>,
) -> Result<Json<PoolStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let target = query.target.as_deref().unwrap_or(STATUS_ALL);
    if target == STATUS_ALL {
        return Ok(Json(PoolStatusResponse::All(state.registry.statuses())));
    }

    state
        .registry
        .status(target)
        .map(|status| Json(PoolStatusResponse::Single(status)))
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("no pool for {}", target),
                }),
            )
        })
}

/// POST /api/pool/remove - retire pools of backends that went away
pub async fn remove_pools<D: Dialer>(
    State(state): State<ApiState<D>>,
    Json(request): Json<RemovePoolsRequest>,
) -> (StatusCode, Json<RemovePoolsResponse>) {
    let removed = state.registry.remove(&request.addresses);
    info!(requested = request.addresses.len(), removed = removed.len(), "pools removed via API");
    (StatusCode::OK, Json(RemovePoolsResponse { removed }))
}
