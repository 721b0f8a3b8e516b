//! # Job Trigger Handlers
//!
//! Explicit triggers for the background jobs. A trigger that arrives while
//! the job is running waits for that run instead of starting another.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::OperatorAuth;
use crate::background_fetch::BackgroundFetchRunStats;
use crate::error::{ApiError, validation_error};
use crate::scheduled_updates::ScheduledUpdateRunStats;
use crate::server::AppState;

/// Result of a stop request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StopJobResponse {
    #[schema(example = "background-fetch")]
    pub job: String,
    /// Whether a run was in flight and received the stop request
    pub stopping: bool,
}

/// Run the background fetch now
#[utoipa::path(
    post,
    path = "/v1/jobs/background-fetch",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Run statistics", body = BackgroundFetchRunStats),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 503, description = "Background fetch is disabled", body = ApiError),
        (status = 504, description = "Run exceeded its deadline", body = ApiError),
        (status = 500, description = "Run failed", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn trigger_background_fetch(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<BackgroundFetchRunStats>, ApiError> {
    let stats = state.background_fetch.run_background_fetch().await?;
    Ok(Json(stats))
}

/// Perform the scheduled updates that are due now
#[utoipa::path(
    post,
    path = "/v1/jobs/scheduled-updates",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Run statistics", body = ScheduledUpdateRunStats),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 503, description = "Scheduled updates are disabled", body = ApiError),
        (status = 504, description = "Run exceeded its deadline", body = ApiError),
        (status = 500, description = "Run failed", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn trigger_scheduled_updates(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
) -> Result<Json<ScheduledUpdateRunStats>, ApiError> {
    let stats = state.scheduled_updates.update_custom_audience().await?;
    Ok(Json(stats))
}

/// Ask an in-flight run to stop
#[utoipa::path(
    post,
    path = "/v1/jobs/{job}/stop",
    security(("bearer_auth" = [])),
    params(
        ("job" = String, Path, description = "Either background-fetch or scheduled-updates")
    ),
    responses(
        (status = 200, description = "Stop request handled", body = StopJobResponse),
        (status = 400, description = "Unknown job", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn stop_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(job): Path<String>,
) -> Result<Json<StopJobResponse>, ApiError> {
    let stopping = match job.as_str() {
        "background-fetch" => state.background_fetch.stop_work().await,
        "scheduled-updates" => state.scheduled_updates.stop_work().await,
        _ => {
            return Err(validation_error(
                "Unknown job",
                serde_json::json!({
                    "job": "Must be one of: background-fetch, scheduled-updates"
                }),
            ));
        }
    };

    tracing::info!(job = %job, stopping, "Stop requested");
    Ok(Json(StopJobResponse { job, stopping }))
}
