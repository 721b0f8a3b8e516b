//! # Error Handling
//!
//! Shared error types: the problem+json [`ApiError`] returned by the HTTP
//! surface, [`StoreError`] raised by the repositories and [`PipelineError`]
//! which fails a whole background run.

use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                let id = uuid::Uuid::new_v4().simple().to_string();
                Some(format!("corr-{}", &id[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message.as_str())
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Disabled { job } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "JOB_DISABLED".to_string(),
                format!("{job} is disabled"),
            ),
            PipelineError::Timeout { .. } => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "JOB_TIMEOUT".to_string(),
                error.to_string(),
            ),
            other => {
                tracing::error!(error = ?other, "Job run failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR".to_string(),
                    other.to_string(),
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

/// Errors raised by the audience and scheduled-update repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("an update is already pending for owner {owner} and buyer {buyer}")]
    PendingUpdateExists { owner: String, buyer: String },
    #[error("custom audience quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("failed to encode {field}: {source}")]
    Serialization {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("stored {field} is malformed: {message}")]
    Corrupt { field: &'static str, message: String },
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::Database(err) if is_unique_violation(err))
    }
}

/// Failure of a whole background run; per-row failures never surface here.
///
/// Clone so a single result can be handed to every caller joined on the run.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("{job} run exceeded its {timeout:?} deadline")]
    Timeout { job: &'static str, timeout: Duration },
    #[error("{job} is disabled")]
    Disabled { job: &'static str },
    #[error("store unavailable: {0}")]
    Store(String),
    #[error("{job} run task failed: {message}")]
    TaskFailed { job: &'static str, message: String },
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        PipelineError::Store(error.to_string())
    }
}

pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "Test error message",
        );

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.details, None);
        assert_eq!(error.retry_after, None);
    }

    #[test]
    fn test_retry_after_header() {
        let error = ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMIT_REACHED",
            "Rate limit exceeded",
        )
        .with_retry_after(1);

        let response = error.into_response();

        assert_eq!(response.headers().get("retry-after").unwrap(), "1");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_trace_id_fallback_format() {
        let error = ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "X", "Test error");

        let trace_id = error.trace_id.unwrap();
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13);
    }

    #[test]
    fn test_validation_error_with_details() {
        let field_errors = json!({ "min_delay_minutes": "must be at least 30" });
        let error = validation_error("Validation failed", field_errors.clone());

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.details, Some(Box::new(field_errors)));
    }

    #[test]
    fn test_pipeline_error_status_mapping() {
        let disabled: ApiError = PipelineError::Disabled {
            job: "background fetch",
        }
        .into();
        assert_eq!(disabled.status, StatusCode::SERVICE_UNAVAILABLE);

        let timeout: ApiError = PipelineError::Timeout {
            job: "scheduled updates",
            timeout: Duration::from_secs(5),
        }
        .into();
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.code, Box::from("JOB_TIMEOUT"));
    }

    #[test]
    fn test_non_sqlx_errors_are_not_unique_violations() {
        let error = StoreError::Database(sea_orm::DbErr::RecordNotFound("x".to_string()));
        assert!(!error.is_unique_violation());
    }
}
