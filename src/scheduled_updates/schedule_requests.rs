//! Schedule requests carried in a scheduled update's response, and the
//! request body sent to the buyer.

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::access::BuyerResolutionError;
use crate::audience::{JsonShapeError, PartialCustomAudience, read_partial_custom_audience};
use crate::audience_blob::AudienceBlob;
use crate::error::StoreError;
use crate::schedule_update::DelayError;

pub const SCHEDULE_KEY: &str = "schedule";
pub const REQUESTS_KEY: &str = "requests";
pub const UPDATE_URI_KEY: &str = "update_uri";
pub const MIN_DELAY_KEY: &str = "min_delay";
pub const SHOULD_REPLACE_PENDING_UPDATES_KEY: &str = "should_replace_pending_updates";
pub const PARTIAL_CUSTOM_AUDIENCES_KEY: &str = "partial_custom_audience_data";
pub const LEAVE_KEY: &str = "leave";

#[derive(Debug, Error)]
pub enum ScheduleRequestError {
    #[error(transparent)]
    Json(#[from] JsonShapeError),
    #[error(transparent)]
    InvalidDelay(#[from] DelayError),
    #[error(transparent)]
    Unauthorized(#[from] BuyerResolutionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScheduleRequestError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleRequestError::Json(_) => "json_error",
            ScheduleRequestError::InvalidDelay(_) => "invalid_argument",
            ScheduleRequestError::Unauthorized(_) => "unauthorized",
            ScheduleRequestError::Store(_) => "store_error",
        }
    }
}

/// A further delayed update requested by a buyer response.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRequest {
    pub update_uri: String,
    pub min_delay_minutes: i64,
    pub should_replace_pending_updates: bool,
    pub partial_custom_audiences: Vec<PartialCustomAudience>,
    pub leave_names: Vec<String>,
}

/// Objects under `schedule.requests`; anything else is skipped.
pub fn extract_schedule_requests(response: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    response
        .get(SCHEDULE_KEY)
        .and_then(|s| s.get(REQUESTS_KEY))
        .and_then(Value::as_array)
        .map(|requests| requests.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

/// Reads one request. A malformed partial audience or an empty leave name
/// fails the whole request.
pub fn parse_schedule_request(
    request: &Map<String, Value>,
) -> Result<ScheduleRequest, ScheduleRequestError> {
    let update_uri = request
        .get(UPDATE_URI_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| JsonShapeError::new(UPDATE_URI_KEY, "missing or not a string"))?
        .to_string();

    let min_delay_minutes = request
        .get(MIN_DELAY_KEY)
        .and_then(Value::as_i64)
        .ok_or_else(|| JsonShapeError::new(MIN_DELAY_KEY, "missing or not an integer"))?;

    let should_replace_pending_updates = match request.get(SHOULD_REPLACE_PENDING_UPDATES_KEY) {
        None => false,
        Some(value) => value.as_bool().ok_or_else(|| {
            JsonShapeError::new(SHOULD_REPLACE_PENDING_UPDATES_KEY, "expected a boolean")
        })?,
    };

    let partial_custom_audiences = match request.get(PARTIAL_CUSTOM_AUDIENCES_KEY) {
        None => Vec::new(),
        Some(value) => value
            .as_array()
            .ok_or_else(|| JsonShapeError::new(PARTIAL_CUSTOM_AUDIENCES_KEY, "expected an array"))?
            .iter()
            .map(read_partial_custom_audience)
            .collect::<Result<_, _>>()?,
    };

    let leave_names = match request.get(LEAVE_KEY) {
        None => Vec::new(),
        Some(value) => value
            .as_array()
            .ok_or_else(|| JsonShapeError::new(LEAVE_KEY, "expected an array"))?
            .iter()
            .map(|name| match name.as_str() {
                Some(name) if !name.is_empty() => Ok(name.to_string()),
                _ => Err(JsonShapeError::new(LEAVE_KEY, "expected non-empty names")),
            })
            .collect::<Result<_, _>>()?,
    };

    Ok(ScheduleRequest {
        update_uri,
        min_delay_minutes,
        should_replace_pending_updates,
        partial_custom_audiences,
        leave_names,
    })
}

/// POST body for a scheduled update. With nested scheduling enabled the
/// overrides travel next to the leave names; otherwise the body is the bare
/// override array.
pub fn request_body(overrides: &[AudienceBlob], leave_names: &[String], nested_enabled: bool) -> Value {
    let overrides: Vec<Value> = overrides.iter().map(AudienceBlob::to_json).collect();
    if nested_enabled {
        json!({
            PARTIAL_CUSTOM_AUDIENCES_KEY: overrides,
            LEAVE_KEY: leave_names,
        })
    } else {
        Value::Array(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audience_blob::BlobOptions;

    fn request(value: Value) -> Result<ScheduleRequest, ScheduleRequestError> {
        parse_schedule_request(value.as_object().unwrap())
    }

    #[test]
    fn test_extract_skips_non_objects() {
        let response = json!({
            "schedule": {"requests": [{"update_uri": "https://b.com"}, "junk", 4]}
        });
        assert_eq!(extract_schedule_requests(response.as_object().unwrap()).len(), 1);

        let no_schedule = json!({"join": []});
        assert!(extract_schedule_requests(no_schedule.as_object().unwrap()).is_empty());
    }

    #[test]
    fn test_parse_full_request() {
        let parsed = request(json!({
            "update_uri": "https://buyer.com/next",
            "min_delay": 45,
            "should_replace_pending_updates": true,
            "partial_custom_audience_data": [{"name": "a"}, {"name": "b"}],
            "leave": ["c"]
        }))
        .unwrap();

        assert_eq!(parsed.min_delay_minutes, 45);
        assert!(parsed.should_replace_pending_updates);
        assert_eq!(parsed.partial_custom_audiences.len(), 2);
        assert_eq!(parsed.leave_names, vec!["c".to_string()]);
    }

    #[test]
    fn test_optional_lists_default_to_empty() {
        let parsed = request(json!({"update_uri": "https://buyer.com/next", "min_delay": 30})).unwrap();
        assert!(!parsed.should_replace_pending_updates);
        assert!(parsed.partial_custom_audiences.is_empty());
        assert!(parsed.leave_names.is_empty());
    }

    #[test]
    fn test_bad_entries_fail_the_request() {
        assert!(request(json!({"min_delay": 30})).is_err());
        assert!(request(json!({"update_uri": "https://b.com", "min_delay": 30, "leave": ["", "x"]})).is_err());
        assert!(
            request(json!({
                "update_uri": "https://b.com",
                "min_delay": 30,
                "partial_custom_audience_data": [[], {"name": "a"}]
            }))
            .is_err()
        );
    }

    #[test]
    fn test_request_body_shapes() {
        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.set_name("a");
        let leave = vec!["b".to_string()];

        let nested = request_body(std::slice::from_ref(&blob), &leave, true);
        assert_eq!(nested["partial_custom_audience_data"][0]["name"], "a");
        assert_eq!(nested["leave"][0], "b");

        let flat = request_body(&[blob], &leave, false);
        assert_eq!(flat, json!([{"name": "a"}]));
    }
}
