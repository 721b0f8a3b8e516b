//! # Scheduling API Handler
//!
//! Records a delayed custom audience update on behalf of an owner.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::audience::PartialCustomAudience;
use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::http_fetcher::DevContext;
use crate::schedule_update::{ScheduleResultCode, ScheduleUpdateError, ScheduleUpdateInput};
use crate::server::AppState;

/// Request payload for scheduling an update
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ScheduleUpdateRequest {
    /// Application that owns the audiences
    #[schema(example = "com.example.shoes")]
    pub owner: String,
    /// Buyer endpoint that receives the POST once the update is due
    #[schema(example = "https://buyer.example.com/update")]
    pub update_uri: String,
    /// Delay before the update runs, between 30 and 300 minutes
    #[schema(example = 60)]
    pub min_delay_minutes: i64,
    /// Partial audiences sent with the update and fused into its joins
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub partial_custom_audience_data: Vec<PartialCustomAudience>,
    /// Replace a pending update for the same owner and buyer
    #[serde(default)]
    pub should_replace_pending_updates: bool,
    /// Allow plain HTTP and loopback endpoints when the update runs
    #[serde(default)]
    pub debuggable: bool,
}

/// Response payload for a scheduled update
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScheduleUpdateResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub update_id: String,
    #[schema(example = "buyer.example.com")]
    pub buyer: String,
    #[schema(example = "2024-01-15T11:30:00Z")]
    pub scheduled_time: DateTime<Utc>,
}

impl From<ScheduleUpdateError> for ApiError {
    fn from(error: ScheduleUpdateError) -> Self {
        let code = error.code();
        let status = match code {
            ScheduleResultCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ScheduleResultCode::RateLimitReached => StatusCode::TOO_MANY_REQUESTS,
            ScheduleResultCode::UpdateAlreadyPending => StatusCode::CONFLICT,
            ScheduleResultCode::Success | ScheduleResultCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let api_error = ApiError::new(status, code.as_str().to_string(), error.to_string());
        match code {
            ScheduleResultCode::RateLimitReached => api_error.with_retry_after(1),
            _ => api_error,
        }
    }
}

/// Schedule a delayed custom audience update
#[utoipa::path(
    post,
    path = "/v1/scheduled-updates",
    security(("bearer_auth" = [])),
    request_body = ScheduleUpdateRequest,
    responses(
        (status = 201, description = "Update scheduled", body = ScheduleUpdateResponse),
        (status = 400, description = "Invalid delay, URI or payload", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 409, description = "An update is already pending for this owner and buyer", body = ApiError),
        (status = 429, description = "Owner exceeded the scheduling rate", body = ApiError),
        (status = 500, description = "Scheduling is disabled or storage failed", body = ApiError)
    ),
    tag = "scheduled-updates"
)]
pub async fn schedule_update(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    payload: Result<Json<ScheduleUpdateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ScheduleUpdateResponse>), ApiError> {
    let Json(request) = payload?;

    let input = ScheduleUpdateInput {
        owner: request.owner,
        update_uri: request.update_uri,
        min_delay_minutes: request.min_delay_minutes,
        partial_custom_audiences: request.partial_custom_audience_data,
        should_replace_pending_updates: request.should_replace_pending_updates,
    };

    let update = state
        .schedule_service
        .schedule_update(input, DevContext::for_debuggable(request.debuggable))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ScheduleUpdateResponse {
            update_id: update.id.to_string(),
            buyer: update.buyer,
            scheduled_time: update.scheduled_time,
        }),
    ))
}
