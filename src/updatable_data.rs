//! # Updatable Data
//!
//! Result of parsing a daily-fetch response body. Each payload group
//! (signals, trusted bidding data, ads) is extracted independently; the
//! capsule either adopts the groups that parsed or, when the update is not
//! considered successful, carries none of them.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::audience::{
    ADS_KEY, AdData, AdReadOptions, TRUSTED_BIDDING_DATA_KEY, TrustedBiddingData,
    USER_BIDDING_SIGNALS_KEY, read_ads_lenient, read_trusted_bidding_data,
    read_user_bidding_signals,
};

/// Outcome of a fetch attempt before (and after) payload validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResultType {
    Success,
    NetworkFailure,
    Unknown,
    ValidationFailure,
}

impl UpdateResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateResultType::Success => "success",
            UpdateResultType::NetworkFailure => "network_failure",
            UpdateResultType::Unknown => "unknown",
            UpdateResultType::ValidationFailure => "validation_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatableData {
    pub user_bidding_signals: Option<Value>,
    pub trusted_bidding_data: Option<TrustedBiddingData>,
    pub ads: Option<Vec<AdData>>,
    pub attempted_update_time: DateTime<Utc>,
    pub initial_update_result: UpdateResultType,
    pub contains_successful_update: bool,
}

/// Per-group parse state.
#[derive(Debug, Default)]
struct GroupOutcome {
    found: bool,
    errored: bool,
}

impl GroupOutcome {
    fn parsed(&self) -> bool {
        self.found && !self.errored
    }
}

impl UpdatableData {
    /// Parses a response body fetched with `initial_update_result`.
    ///
    /// An empty body, or a JSON object with none of the payload keys, is a
    /// deliberate no-op and counts as success. A body with payload keys that
    /// all fail to parse is a failed update.
    pub fn from_response(
        attempted_update_time: DateTime<Utc>,
        initial_update_result: UpdateResultType,
        response: &str,
        ad_options: &AdReadOptions,
    ) -> Self {
        let mut data = Self::empty(attempted_update_time, initial_update_result);

        if initial_update_result != UpdateResultType::Success {
            return data;
        }

        if response.trim().is_empty() {
            data.contains_successful_update = true;
            return data;
        }

        let json = match serde_json::from_str::<Value>(response) {
            Ok(Value::Object(obj)) => obj,
            Ok(_) | Err(_) => {
                tracing::debug!(
                    response_len = response.len(),
                    "Update response is not a JSON object"
                );
                return data;
            }
        };

        let mut signals_outcome = GroupOutcome::default();
        if let Some(value) = json.get(USER_BIDDING_SIGNALS_KEY) {
            signals_outcome.found = true;
            match read_user_bidding_signals(value) {
                Ok(signals) => data.user_bidding_signals = Some(signals),
                Err(err) => {
                    signals_outcome.errored = true;
                    tracing::debug!(error = %err, "Invalid user bidding signals in response");
                }
            }
        }

        let mut trusted_outcome = GroupOutcome::default();
        if let Some(value) = json.get(TRUSTED_BIDDING_DATA_KEY) {
            trusted_outcome.found = true;
            match read_trusted_bidding_data(value) {
                Ok(trusted) => data.trusted_bidding_data = Some(trusted),
                Err(err) => {
                    trusted_outcome.errored = true;
                    tracing::debug!(error = %err, "Invalid trusted bidding data in response");
                }
            }
        }

        let mut ads_outcome = GroupOutcome::default();
        if let Some(value) = json.get(ADS_KEY) {
            ads_outcome.found = true;
            match read_ads_lenient(value, ad_options) {
                Ok(ads) => data.ads = Some(ads),
                Err(err) => {
                    ads_outcome.errored = true;
                    tracing::debug!(error = %err, "Invalid ads in response");
                }
            }
        }

        let outcomes = [&signals_outcome, &trusted_outcome, &ads_outcome];
        let any_found = outcomes.iter().any(|o| o.found);
        let any_parsed = outcomes.iter().any(|o| o.parsed());

        data.contains_successful_update = !any_found || any_parsed;
        if !data.contains_successful_update {
            data.clear_payload();
        }
        data
    }

    /// Capsule for a failed attempt that carries no payload.
    pub fn failed(attempted_update_time: DateTime<Utc>, result: UpdateResultType) -> Self {
        Self::empty(attempted_update_time, result)
    }

    /// Discards the payload after a post-parse check rejected it.
    pub fn into_validation_failure(mut self) -> Self {
        self.clear_payload();
        self.initial_update_result = UpdateResultType::ValidationFailure;
        self.contains_successful_update = false;
        self
    }

    /// Final classification used for bookkeeping and metrics.
    pub fn result_type(&self) -> UpdateResultType {
        if self.contains_successful_update {
            UpdateResultType::Success
        } else if self.initial_update_result == UpdateResultType::Success {
            UpdateResultType::ValidationFailure
        } else {
            self.initial_update_result
        }
    }

    fn empty(attempted_update_time: DateTime<Utc>, initial_update_result: UpdateResultType) -> Self {
        Self {
            user_bidding_signals: None,
            trusted_bidding_data: None,
            ads: None,
            attempted_update_time,
            initial_update_result,
            contains_successful_update: false,
        }
    }

    fn clear_payload(&mut self) {
        self.user_bidding_signals = None;
        self.trusted_bidding_data = None;
        self.ads = None;
    }
}
