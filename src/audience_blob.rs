//! # Audience Blob
//!
//! A sparse audience under construction. Fields are read from JSON in a fixed
//! canonical order and written back in the order they were first set, so a
//! blob can be seeded from a partial override, overlaid with a buyer response
//! and checked for completeness before it becomes a [`CustomAudience`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::audience::{
    AdData, AdReadOptions, AuctionServerRequestFlags, CustomAudience, JsonShapeError,
    OMIT_ADS_VALUE, PartialCustomAudience, TrustedBiddingData, ads_to_json, read_ads_strict,
    read_string, read_time, read_trusted_bidding_data, read_user_bidding_signals,
    trusted_bidding_data_to_json,
};
use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudienceField {
    Owner,
    Buyer,
    Name,
    ActivationTime,
    ExpirationTime,
    DailyUpdateUri,
    BiddingLogicUri,
    UserBiddingSignals,
    TrustedBiddingData,
    Ads,
    AuctionServerRequestFlags,
    Priority,
}

impl AudienceField {
    /// Fields every persisted audience carries, in read order.
    pub const CANONICAL: [AudienceField; 10] = [
        AudienceField::Owner,
        AudienceField::Buyer,
        AudienceField::Name,
        AudienceField::ActivationTime,
        AudienceField::ExpirationTime,
        AudienceField::DailyUpdateUri,
        AudienceField::BiddingLogicUri,
        AudienceField::UserBiddingSignals,
        AudienceField::TrustedBiddingData,
        AudienceField::Ads,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            AudienceField::Owner => "owner",
            AudienceField::Buyer => "buyer",
            AudienceField::Name => "name",
            AudienceField::ActivationTime => "activation_time",
            AudienceField::ExpirationTime => "expiration_time",
            AudienceField::DailyUpdateUri => "daily_update_uri",
            AudienceField::BiddingLogicUri => "bidding_logic_uri",
            AudienceField::UserBiddingSignals => "user_bidding_signals",
            AudienceField::TrustedBiddingData => "trusted_bidding_data",
            AudienceField::Ads => "ads",
            AudienceField::AuctionServerRequestFlags => "auction_server_request_flags",
            AudienceField::Priority => "priority",
        }
    }

    fn is_canonical(&self) -> bool {
        !matches!(
            self,
            AudienceField::AuctionServerRequestFlags | AudienceField::Priority
        )
    }
}

/// Feature-gated parts of the blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobOptions {
    pub auction_server_request_flags: bool,
    pub priority: bool,
    pub ads: AdReadOptions,
}

impl BlobOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            auction_server_request_flags: config.features.auction_server_request_flags,
            priority: config.features.seller_configuration,
            ads: AdReadOptions::from_config(config),
        }
    }

    fn read_order(&self) -> Vec<AudienceField> {
        let mut fields = AudienceField::CANONICAL.to_vec();
        if self.auction_server_request_flags {
            fields.push(AudienceField::AuctionServerRequestFlags);
        }
        if self.priority {
            fields.push(AudienceField::Priority);
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    #[error("audience JSON must be an object")]
    NotAnObject,
    #[error(transparent)]
    Shape(#[from] JsonShapeError),
    #[error("incomplete audience, missing: {}", .missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },
}

#[derive(Debug, Clone, Default)]
pub struct AudienceBlob {
    options: BlobOptions,
    order: Vec<AudienceField>,
    owner: Option<String>,
    buyer: Option<String>,
    name: Option<String>,
    activation_time: Option<DateTime<Utc>>,
    expiration_time: Option<DateTime<Utc>>,
    daily_update_uri: Option<String>,
    bidding_logic_uri: Option<String>,
    user_bidding_signals: Option<Value>,
    trusted_bidding_data: Option<TrustedBiddingData>,
    ads: Option<Vec<AdData>>,
    auction_server_request_flags: Option<AuctionServerRequestFlags>,
    priority: Option<f64>,
}

impl PartialEq for AudienceBlob {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner
            && self.buyer == other.buyer
            && self.name == other.name
            && self.activation_time == other.activation_time
            && self.expiration_time == other.expiration_time
            && self.daily_update_uri == other.daily_update_uri
            && self.bidding_logic_uri == other.bidding_logic_uri
            && self.user_bidding_signals == other.user_bidding_signals
            && self.trusted_bidding_data == other.trusted_bidding_data
            && self.ads == other.ads
            && self.auction_server_request_flags == other.auction_server_request_flags
            && self.priority == other.priority
    }
}

impl AudienceBlob {
    pub fn new(options: BlobOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Fields in the order they were first set.
    pub fn fields(&self) -> &[AudienceField] {
        &self.order
    }

    pub fn has_field(&self, field: AudienceField) -> bool {
        self.order.contains(&field)
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn buyer(&self) -> Option<&str> {
        self.buyer.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn activation_time(&self) -> Option<DateTime<Utc>> {
        self.activation_time
    }

    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        self.expiration_time
    }

    pub fn daily_update_uri(&self) -> Option<&str> {
        self.daily_update_uri.as_deref()
    }

    pub fn bidding_logic_uri(&self) -> Option<&str> {
        self.bidding_logic_uri.as_deref()
    }

    pub fn user_bidding_signals(&self) -> Option<&Value> {
        self.user_bidding_signals.as_ref()
    }

    pub fn trusted_bidding_data(&self) -> Option<&TrustedBiddingData> {
        self.trusted_bidding_data.as_ref()
    }

    pub fn ads(&self) -> Option<&[AdData]> {
        self.ads.as_deref()
    }

    pub fn auction_server_request_flags(&self) -> Option<AuctionServerRequestFlags> {
        self.auction_server_request_flags
    }

    pub fn priority(&self) -> Option<f64> {
        self.priority
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.mark(AudienceField::Owner);
        self.owner = Some(owner.into());
    }

    pub fn set_buyer(&mut self, buyer: impl Into<String>) {
        self.mark(AudienceField::Buyer);
        self.buyer = Some(buyer.into());
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.mark(AudienceField::Name);
        self.name = Some(name.into());
    }

    pub fn set_activation_time(&mut self, time: DateTime<Utc>) {
        self.mark(AudienceField::ActivationTime);
        self.activation_time = Some(time);
    }

    pub fn set_expiration_time(&mut self, time: DateTime<Utc>) {
        self.mark(AudienceField::ExpirationTime);
        self.expiration_time = Some(time);
    }

    pub fn set_daily_update_uri(&mut self, uri: impl Into<String>) {
        self.mark(AudienceField::DailyUpdateUri);
        self.daily_update_uri = Some(uri.into());
    }

    pub fn set_bidding_logic_uri(&mut self, uri: impl Into<String>) {
        self.mark(AudienceField::BiddingLogicUri);
        self.bidding_logic_uri = Some(uri.into());
    }

    pub fn set_user_bidding_signals(&mut self, signals: Value) {
        self.mark(AudienceField::UserBiddingSignals);
        self.user_bidding_signals = Some(signals);
    }

    pub fn set_trusted_bidding_data(&mut self, data: TrustedBiddingData) {
        self.mark(AudienceField::TrustedBiddingData);
        self.trusted_bidding_data = Some(data);
    }

    pub fn set_ads(&mut self, ads: Vec<AdData>) {
        self.mark(AudienceField::Ads);
        self.ads = Some(ads);
    }

    pub fn set_auction_server_request_flags(&mut self, flags: AuctionServerRequestFlags) {
        self.mark(AudienceField::AuctionServerRequestFlags);
        self.auction_server_request_flags = Some(flags);
    }

    pub fn set_priority(&mut self, priority: f64) {
        self.mark(AudienceField::Priority);
        self.priority = Some(priority);
    }

    fn mark(&mut self, field: AudienceField) {
        if !self.order.contains(&field) {
            self.order.push(field);
        }
    }

    /// Reads every recognized key present in `json`; other keys are ignored.
    ///
    /// A malformed value fails the call. Fields read before the failure stay
    /// set, so callers discard the blob on error.
    pub fn populate_from_json(&mut self, json: &Value) -> Result<(), BlobError> {
        let obj = json.as_object().ok_or(BlobError::NotAnObject)?;

        for field in self.options.read_order() {
            let Some(value) = obj.get(field.key()) else {
                continue;
            };
            let key = field.key();
            match field {
                AudienceField::Owner => self.set_owner(read_string(key, value)?),
                AudienceField::Buyer => self.set_buyer(read_string(key, value)?),
                AudienceField::Name => self.set_name(read_string(key, value)?),
                AudienceField::ActivationTime => self.set_activation_time(read_time(key, value)?),
                AudienceField::ExpirationTime => self.set_expiration_time(read_time(key, value)?),
                AudienceField::DailyUpdateUri => self.set_daily_update_uri(read_string(key, value)?),
                AudienceField::BiddingLogicUri => {
                    self.set_bidding_logic_uri(read_string(key, value)?)
                }
                AudienceField::UserBiddingSignals => {
                    self.set_user_bidding_signals(read_user_bidding_signals(value)?)
                }
                AudienceField::TrustedBiddingData => {
                    self.set_trusted_bidding_data(read_trusted_bidding_data(value)?)
                }
                AudienceField::Ads => self.set_ads(read_ads_strict(value, &self.options.ads)?),
                AudienceField::AuctionServerRequestFlags => {
                    self.set_auction_server_request_flags(read_request_flags(value)?)
                }
                AudienceField::Priority => {
                    let priority = value
                        .as_f64()
                        .ok_or_else(|| JsonShapeError::new(key, "expected a number"))?;
                    self.set_priority(priority)
                }
            }
        }

        Ok(())
    }

    /// Seeds the identity fields and whatever the override carries.
    pub fn populate_from_partial(
        &mut self,
        owner: &str,
        buyer: &str,
        partial: &PartialCustomAudience,
    ) {
        self.set_owner(owner);
        self.set_buyer(buyer);
        self.set_name(partial.name.as_str());
        if let Some(time) = partial.activation_time {
            self.set_activation_time(time);
        }
        if let Some(time) = partial.expiration_time {
            self.set_expiration_time(time);
        }
        if let Some(signals) = &partial.user_bidding_signals {
            self.set_user_bidding_signals(signals.clone());
        }
    }

    /// Serializes the populated fields in insertion order.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for field in &self.order {
            if let Some(value) = self.field_json(*field) {
                obj.insert(field.key().to_string(), value);
            }
        }
        Value::Object(obj)
    }

    /// UTF-8 length of the serialized blob.
    pub fn size_bytes(&self) -> usize {
        self.to_json().to_string().len()
    }

    pub fn missing_canonical_fields(&self) -> Vec<&'static str> {
        AudienceField::CANONICAL
            .iter()
            .filter(|f| !self.has_field(**f))
            .map(AudienceField::key)
            .collect()
    }

    /// Whether every canonical field is populated; optional fields are ignored.
    pub fn is_complete(&self) -> bool {
        let canonical = self.order.iter().filter(|f| f.is_canonical()).count();
        canonical == AudienceField::CANONICAL.len()
    }

    /// Converts a complete blob into an audience and its daily update URI.
    pub fn to_custom_audience(&self) -> Result<(CustomAudience, String), BlobError> {
        let incomplete = || BlobError::Incomplete {
            missing: self.missing_canonical_fields(),
        };

        let audience = CustomAudience {
            owner: self.owner.clone().ok_or_else(incomplete)?,
            buyer: self.buyer.clone().ok_or_else(incomplete)?,
            name: self.name.clone().ok_or_else(incomplete)?,
            activation_time: self.activation_time.ok_or_else(incomplete)?,
            expiration_time: self.expiration_time.ok_or_else(incomplete)?,
            bidding_logic_uri: self.bidding_logic_uri.clone().ok_or_else(incomplete)?,
            user_bidding_signals: Some(self.user_bidding_signals.clone().ok_or_else(incomplete)?),
            trusted_bidding_data: Some(self.trusted_bidding_data.clone().ok_or_else(incomplete)?),
            ads: Some(self.ads.clone().ok_or_else(incomplete)?),
            auction_server_request_flags: self.auction_server_request_flags.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
        };
        let daily_update_uri = self.daily_update_uri.clone().ok_or_else(incomplete)?;

        Ok((audience, daily_update_uri))
    }

    fn field_json(&self, field: AudienceField) -> Option<Value> {
        match field {
            AudienceField::Owner => self.owner.clone().map(Value::String),
            AudienceField::Buyer => self.buyer.clone().map(Value::String),
            AudienceField::Name => self.name.clone().map(Value::String),
            AudienceField::ActivationTime => self.activation_time.map(millis),
            AudienceField::ExpirationTime => self.expiration_time.map(millis),
            AudienceField::DailyUpdateUri => self.daily_update_uri.clone().map(Value::String),
            AudienceField::BiddingLogicUri => self.bidding_logic_uri.clone().map(Value::String),
            AudienceField::UserBiddingSignals => self.user_bidding_signals.clone(),
            AudienceField::TrustedBiddingData => self
                .trusted_bidding_data
                .as_ref()
                .map(trusted_bidding_data_to_json),
            AudienceField::Ads => self.ads.as_deref().map(ads_to_json),
            AudienceField::AuctionServerRequestFlags => {
                self.auction_server_request_flags.map(|flags| {
                    Value::Array(
                        flags
                            .names()
                            .into_iter()
                            .map(|n| Value::String(n.to_string()))
                            .collect(),
                    )
                })
            }
            AudienceField::Priority => self
                .priority
                .map(|p| Number::from_f64(p).map(Value::Number).unwrap_or(Value::Null)),
        }
    }
}

fn millis(time: DateTime<Utc>) -> Value {
    Value::from(time.timestamp_millis())
}

/// Unknown flag names and non-string entries are ignored.
fn read_request_flags(value: &Value) -> Result<AuctionServerRequestFlags, JsonShapeError> {
    let entries = value.as_array().ok_or_else(|| {
        JsonShapeError::new(AudienceField::AuctionServerRequestFlags.key(), "expected an array")
    })?;

    let mut flags = AuctionServerRequestFlags::default();
    for entry in entries {
        if entry.as_str() == Some(OMIT_ADS_VALUE) {
            flags.0 |= AuctionServerRequestFlags::OMIT_ADS;
        }
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn complete_json() -> Value {
        let now = Utc::now().timestamp_millis();
        json!({
            "owner": "com.owner",
            "buyer": "buyer.com",
            "name": "shoes",
            "activation_time": now,
            "expiration_time": now + Duration::days(1).num_milliseconds(),
            "daily_update_uri": "https://buyer.com/daily",
            "bidding_logic_uri": "https://buyer.com/bidding",
            "user_bidding_signals": {"tier": "gold"},
            "trusted_bidding_data": {
                "trusted_bidding_uri": "https://buyer.com/tbd",
                "trusted_bidding_keys": ["k1", "k2"]
            },
            "ads": [{"render_uri": "https://buyer.com/ad/1", "metadata": {"price": 3}}]
        })
    }

    #[test]
    fn test_populate_reads_canonical_keys_and_ignores_others() {
        let mut raw = complete_json();
        raw["unexpected"] = json!("ignored");

        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.populate_from_json(&raw).unwrap();

        assert!(blob.is_complete());
        assert_eq!(blob.fields(), &AudienceField::CANONICAL);
        assert!(blob.to_json().get("unexpected").is_none());
    }

    #[test]
    fn test_round_trip_reproduces_blob() {
        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.populate_from_json(&complete_json()).unwrap();

        let mut copy = AudienceBlob::new(BlobOptions::default());
        copy.populate_from_json(&blob.to_json()).unwrap();

        assert_eq!(blob, copy);
        assert_eq!(blob.to_json(), copy.to_json());
    }

    #[test]
    fn test_malformed_value_fails_population() {
        let mut raw = complete_json();
        raw["ads"] = json!([{"render_uri": "https://buyer.com/ad/1", "metadata": {}}, {"metadata": {}}]);

        let mut blob = AudienceBlob::new(BlobOptions::default());
        let err = blob.populate_from_json(&raw).unwrap_err();
        assert!(matches!(err, BlobError::Shape(_)));

        let mut blob = AudienceBlob::new(BlobOptions::default());
        assert_eq!(
            blob.populate_from_json(&json!(["not", "an", "object"])),
            Err(BlobError::NotAnObject)
        );
    }

    #[test]
    fn test_override_wins_after_fusion() {
        let expiry = Utc::now() + Duration::days(3);
        let expiry = DateTime::from_timestamp_millis(expiry.timestamp_millis()).unwrap();
        let mut override_blob = AudienceBlob::new(BlobOptions::default());
        override_blob.populate_from_partial(
            "com.owner",
            "buyer.com",
            &PartialCustomAudience {
                name: "shoes".to_string(),
                expiration_time: Some(expiry),
                user_bidding_signals: Some(json!({"tier": "platinum"})),
                ..Default::default()
            },
        );

        let mut fused = AudienceBlob::new(BlobOptions::default());
        fused.populate_from_json(&complete_json()).unwrap();
        fused.populate_from_json(&override_blob.to_json()).unwrap();

        assert!(fused.is_complete());
        assert_eq!(fused.expiration_time(), Some(expiry));
        assert_eq!(fused.user_bidding_signals(), Some(&json!({"tier": "platinum"})));
        assert_eq!(fused.fields().len(), AudienceField::CANONICAL.len());
    }

    #[test]
    fn test_incomplete_blob_is_rejected() {
        let mut raw = complete_json();
        raw.as_object_mut().unwrap().remove("ads");

        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.populate_from_json(&raw).unwrap();

        assert!(!blob.is_complete());
        assert_eq!(
            blob.to_custom_audience().unwrap_err(),
            BlobError::Incomplete {
                missing: vec!["ads"]
            }
        );
    }

    #[test]
    fn test_optional_fields_only_read_when_enabled() {
        let mut raw = complete_json();
        raw["auction_server_request_flags"] = json!(["omit_ads", 7, "unknown"]);
        raw["priority"] = json!(2.5);

        let mut plain = AudienceBlob::new(BlobOptions::default());
        plain.populate_from_json(&raw).unwrap();
        assert!(plain.auction_server_request_flags().is_none());
        assert!(plain.priority().is_none());

        let options = BlobOptions {
            auction_server_request_flags: true,
            priority: true,
            ..Default::default()
        };
        let mut blob = AudienceBlob::new(options);
        blob.populate_from_json(&raw).unwrap();
        assert!(blob.is_complete());
        assert!(blob.auction_server_request_flags().unwrap().omit_ads());
        assert_eq!(blob.priority(), Some(2.5));
        assert_eq!(blob.to_json()["auction_server_request_flags"], json!(["omit_ads"]));

        let (audience, daily) = blob.to_custom_audience().unwrap();
        assert_eq!(daily, "https://buyer.com/daily");
        assert_eq!(audience.priority, 2.5);
    }

    #[test]
    fn test_malformed_priority_fails_populate() {
        let options = BlobOptions {
            priority: true,
            ..Default::default()
        };
        let mut blob = AudienceBlob::new(options);
        let err = blob
            .populate_from_json(&json!({"name": "a", "priority": "high"}))
            .unwrap_err();

        assert!(matches!(err, BlobError::Shape(ref shape) if shape.key == "priority"));
        assert!(blob.priority().is_none());
    }

    #[test]
    fn test_size_counts_utf8_bytes() {
        let mut blob = AudienceBlob::new(BlobOptions::default());
        blob.set_name("é");
        assert_eq!(blob.size_bytes(), r#"{"name":"é"}"#.len());
        assert_eq!(blob.size_bytes(), 13);
    }
}
