//! # API Handlers
//!
//! HTTP endpoint handlers for the audience-sync API.

pub mod jobs;
pub mod scheduled_updates;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db;
use crate::models::ServiceInfo;
use crate::server::AppState;

/// Liveness and database reachability
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    #[schema(example = "ok")]
    pub database: String,
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Health check including a database round trip
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service and database are healthy", body = HealthResponse),
        (status = 503, description = "Database is unreachable", body = HealthResponse)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match db::health_check(&state.db).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                database: "ok".to_string(),
            }),
        ),
        Err(err) => {
            tracing::warn!(error = ?err, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".to_string(),
                    database: "unreachable".to_string(),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests;
