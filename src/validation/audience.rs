//! Whole-audience validators built from the field validators.

use chrono::{DateTime, Utc};

use super::fields::{
    ActivationTimeValidator, AdsValidator, BuyerUriValidator, BuyerValidator,
    ExpirationTimeValidator, NameValidator, TrustedBiddingDataValidator,
    UserBiddingSignalsValidator,
};
use super::{ValidationError, Validator, into_result};
use crate::audience_blob::AudienceBlob;
use crate::config::AudienceLimitsConfig;
use crate::updatable_data::UpdatableData;

/// Validates the fields present in an [`AudienceBlob`]; absent fields are
/// skipped.
#[derive(Debug, Clone)]
pub struct AudienceBlobValidator {
    limits: AudienceLimitsConfig,
}

impl AudienceBlobValidator {
    pub fn new(limits: AudienceLimitsConfig) -> Self {
        Self { limits }
    }

    pub fn add_violations(
        &self,
        blob: &AudienceBlob,
        now: DateTime<Utc>,
        violations: &mut Vec<String>,
    ) {
        let limits = &self.limits;
        let buyer = blob.buyer();

        if let Some(name) = blob.name() {
            NameValidator {
                max_bytes: limits.max_name_size_bytes,
            }
            .add_violations(name, violations);
        }

        if let Some(signals) = blob.user_bidding_signals() {
            UserBiddingSignalsValidator {
                max_bytes: limits.max_user_bidding_signals_size_bytes,
            }
            .add_violations(signals, violations);
        }

        if let Some(activation) = blob.activation_time() {
            ActivationTimeValidator {
                now,
                max_delay: limits.max_activation_delay(),
            }
            .add_violations(&activation, violations);
        }

        if let Some(expiration) = blob.expiration_time() {
            ExpirationTimeValidator {
                now,
                calculated_activation: blob.activation_time().unwrap_or(now),
                max_expire_in: limits.max_expire_in(),
            }
            .add_violations(&expiration, violations);
        }

        if let Some(buyer) = buyer {
            BuyerValidator.add_violations(buyer, violations);
        }

        if let Some(uri) = blob.bidding_logic_uri() {
            BuyerUriValidator {
                field: "bidding logic URI",
                buyer,
                max_bytes: limits.max_bidding_logic_uri_size_bytes,
            }
            .add_violations(uri, violations);
        }

        if let Some(uri) = blob.daily_update_uri() {
            BuyerUriValidator {
                field: "daily update URI",
                buyer,
                max_bytes: limits.max_daily_update_uri_size_bytes,
            }
            .add_violations(uri, violations);
        }

        if let Some(data) = blob.trusted_bidding_data() {
            TrustedBiddingDataValidator {
                buyer,
                max_bytes: limits.max_trusted_bidding_data_size_bytes,
            }
            .add_violations(data, violations);
        }

        if let Some(ads) = blob.ads() {
            AdsValidator {
                max_count: limits.max_num_ads,
                max_bytes: limits.max_ads_size_bytes,
            }
            .add_violations(ads, violations);
        }
    }

    pub fn validate(&self, blob: &AudienceBlob, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        self.add_violations(blob, now, &mut violations);
        into_result(blob.name().unwrap_or("custom audience"), violations)
    }
}

/// Checks the payload groups of a background fetch against the size limits.
#[derive(Debug, Clone)]
pub struct UpdatableDataValidator {
    limits: AudienceLimitsConfig,
}

impl UpdatableDataValidator {
    pub fn new(limits: AudienceLimitsConfig) -> Self {
        Self { limits }
    }

    pub fn validate(&self, data: &UpdatableData, buyer: &str) -> Result<(), ValidationError> {
        let limits = &self.limits;
        let mut violations = Vec::new();

        if let Some(signals) = &data.user_bidding_signals {
            UserBiddingSignalsValidator {
                max_bytes: limits.max_user_bidding_signals_size_bytes,
            }
            .add_violations(signals, &mut violations);
        }

        if let Some(trusted) = &data.trusted_bidding_data {
            TrustedBiddingDataValidator {
                buyer: Some(buyer),
                max_bytes: limits.max_trusted_bidding_data_size_bytes,
            }
            .add_violations(trusted, &mut violations);
        }

        if let Some(ads) = &data.ads {
            AdsValidator {
                max_count: limits.max_num_ads,
                max_bytes: limits.max_ads_size_bytes,
            }
            .add_violations(ads.as_slice(), &mut violations);
        }

        into_result("fetched update", violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audience::{AdReadOptions, PartialCustomAudience};
    use crate::audience_blob::BlobOptions;
    use crate::updatable_data::UpdateResultType;
    use chrono::Duration;
    use serde_json::json;

    fn validator() -> AudienceBlobValidator {
        AudienceBlobValidator::new(AudienceLimitsConfig::default())
    }

    #[test]
    fn test_expired_audience_reports_violation() {
        let now = Utc::now();
        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.populate_from_partial(
            "com.owner",
            "buyer.com",
            &PartialCustomAudience {
                name: "shoes".to_string(),
                expiration_time: Some(now - Duration::minutes(1)),
                ..Default::default()
            },
        );

        let err = validator().validate(&blob, now).unwrap_err();
        assert_eq!(err.subject, "shoes");
        assert!(err.violations.iter().any(|v| v.contains("already passed")));
    }

    #[test]
    fn test_violations_accumulate_across_fields() {
        let now = Utc::now();
        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.set_buyer("buyer.com");
        blob.set_name("x".repeat(500));
        blob.set_bidding_logic_uri("https://other.com/bid");

        let err = validator().validate(&blob, now).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.violations[0].starts_with("name"));
        assert!(err.violations[1].contains("does not match buyer"));
    }

    #[test]
    fn test_override_only_blob_is_valid() {
        let now = Utc::now();
        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.populate_from_partial(
            "com.owner",
            "buyer.com",
            &PartialCustomAudience {
                name: "shoes".to_string(),
                activation_time: Some(now),
                expiration_time: Some(now + Duration::days(2)),
                user_bidding_signals: Some(json!({"a": 1})),
            },
        );
        assert!(validator().validate(&blob, now).is_ok());
    }

    #[test]
    fn test_updatable_data_size_limits() {
        let limits = AudienceLimitsConfig {
            max_num_ads: 1,
            ..Default::default()
        };
        let body = json!({
            "ads": [
                {"render_uri": "https://buyer.com/1", "metadata": {}},
                {"render_uri": "https://buyer.com/2", "metadata": {}}
            ]
        })
        .to_string();
        let data = UpdatableData::from_response(
            Utc::now(),
            UpdateResultType::Success,
            &body,
            &AdReadOptions::default(),
        );

        let validator = UpdatableDataValidator::new(limits);
        assert!(validator.validate(&data, "buyer.com").is_err());
        assert!(
            UpdatableDataValidator::new(AudienceLimitsConfig::default())
                .validate(&data, "buyer.com")
                .is_ok()
        );
    }
}
