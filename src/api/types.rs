use crate::rpc::PoolStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pools: usize,
}

/// Query for GET /api/pool/status
#[derive(Debug, Default, Deserialize)]
pub struct PoolStatusQuery {
    /// Pool address, or "all" (the default)
    pub target: Option<String>,
}

/// Pool status response: one pool, or every pool keyed by address
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PoolStatusResponse {
    Single(PoolStatus),
    All(BTreeMap<String, PoolStatus>),
}

/// Body of POST /api/pool/remove
#[derive(Debug, Serialize, Deserialize)]
pub struct RemovePoolsRequest {
    pub addresses: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovePoolsResponse {
    pub removed: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
