//! Liveness endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::metadata::store::now_timestamp;
use crate::AppState;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthBody {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    /// Live backend connections in the pool.
    pub connections: usize,
}

/// `GET /` and `GET /health`.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses((status = 200, description = "Server is up", body = HealthBody))
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "online".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now_timestamp(),
        connections: state.pool.len(),
    })
}
