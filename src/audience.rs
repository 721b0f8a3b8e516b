//! # Custom Audience Domain Types
//!
//! The persisted custom audience and its nested pieces (ads, trusted bidding
//! data, filters), plus the lenient JSON readers shared by the audience blob
//! and the daily-fetch response parser.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{AppConfig, FeatureFlags};

pub const USER_BIDDING_SIGNALS_KEY: &str = "user_bidding_signals";
pub const TRUSTED_BIDDING_DATA_KEY: &str = "trusted_bidding_data";
pub const TRUSTED_BIDDING_URI_KEY: &str = "trusted_bidding_uri";
pub const TRUSTED_BIDDING_KEYS_KEY: &str = "trusted_bidding_keys";
pub const ADS_KEY: &str = "ads";
pub const RENDER_URI_KEY: &str = "render_uri";
pub const METADATA_KEY: &str = "metadata";
pub const AD_COUNTER_KEYS_KEY: &str = "ad_counter_keys";
pub const AD_FILTERS_KEY: &str = "ad_filters";
pub const AD_RENDER_ID_KEY: &str = "ad_render_id";
pub const OMIT_ADS_VALUE: &str = "omit_ads";

/// A value was present under `key` but had the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unexpected format for '{key}': {message}")]
pub struct JsonShapeError {
    pub key: String,
    pub message: String,
}

impl JsonShapeError {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Bitfield sent to auction servers alongside the audience.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuctionServerRequestFlags(pub i32);

impl AuctionServerRequestFlags {
    pub const OMIT_ADS: i32 = 1;

    pub fn omit_ads(self) -> bool {
        self.0 & Self::OMIT_ADS != 0
    }

    /// Flag names in wire order.
    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.omit_ads() {
            names.push(OMIT_ADS_VALUE);
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedBiddingData {
    pub trusted_bidding_uri: String,
    pub trusted_bidding_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInstallFilters {
    pub package_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_install: Option<AppInstallFilters>,
    /// Frequency cap definitions are carried through unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_cap: Option<Value>,
}

impl AdFilters {
    fn is_empty(&self) -> bool {
        self.app_install.is_none() && self.frequency_cap.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdData {
    pub render_uri: String,
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ad_counter_keys: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_filters: Option<AdFilters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_render_id: Option<String>,
}

impl AdData {
    /// Serialized footprint counted against the ads size limit.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

/// A fully specified audience as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAudience {
    pub owner: String,
    pub buyer: String,
    pub name: String,
    pub activation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub bidding_logic_uri: String,
    pub user_bidding_signals: Option<Value>,
    pub trusted_bidding_data: Option<TrustedBiddingData>,
    pub ads: Option<Vec<AdData>>,
    pub auction_server_request_flags: AuctionServerRequestFlags,
    pub priority: f64,
}

/// Caller-supplied subset of an audience that wins over remote data.
///
/// Times travel as epoch milliseconds, like every other audience time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartialCustomAudience {
    pub name: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub activation_time: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiration_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_bidding_signals: Option<Value>,
}

/// Which optional ad fields are read from JSON.
#[derive(Debug, Clone, Copy)]
pub struct AdReadOptions {
    pub frequency_cap_filtering: bool,
    pub app_install_filtering: bool,
    pub ad_render_id: bool,
    pub ad_render_id_max_length: usize,
}

impl AdReadOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::from_flags(&config.features, config.limits.ad_render_id_max_length)
    }

    pub fn from_flags(flags: &FeatureFlags, ad_render_id_max_length: usize) -> Self {
        Self {
            frequency_cap_filtering: flags.frequency_cap_filtering,
            app_install_filtering: flags.app_install_filtering,
            ad_render_id: flags.ad_render_id,
            ad_render_id_max_length,
        }
    }
}

impl Default for AdReadOptions {
    fn default() -> Self {
        Self {
            frequency_cap_filtering: false,
            app_install_filtering: false,
            ad_render_id: false,
            ad_render_id_max_length: 12,
        }
    }
}

/// Converts epoch milliseconds to a timestamp.
pub fn millis_to_datetime(key: &str, millis: i64) -> Result<DateTime<Utc>, JsonShapeError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| JsonShapeError::new(key, format!("{millis} is out of range")))
}

pub fn read_time(key: &str, value: &Value) -> Result<DateTime<Utc>, JsonShapeError> {
    let millis = value
        .as_i64()
        .ok_or_else(|| JsonShapeError::new(key, "expected epoch milliseconds"))?;
    millis_to_datetime(key, millis)
}

pub fn read_string(key: &str, value: &Value) -> Result<String, JsonShapeError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| JsonShapeError::new(key, "expected a string"))
}

/// User bidding signals must be a JSON object.
pub fn read_user_bidding_signals(value: &Value) -> Result<Value, JsonShapeError> {
    if value.is_object() {
        Ok(value.clone())
    } else {
        Err(JsonShapeError::new(
            USER_BIDDING_SIGNALS_KEY,
            "expected a JSON object",
        ))
    }
}

/// Non-string keys are skipped; a missing or non-string URI fails.
pub fn read_trusted_bidding_data(value: &Value) -> Result<TrustedBiddingData, JsonShapeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| JsonShapeError::new(TRUSTED_BIDDING_DATA_KEY, "expected a JSON object"))?;

    let trusted_bidding_uri = obj
        .get(TRUSTED_BIDDING_URI_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| JsonShapeError::new(TRUSTED_BIDDING_URI_KEY, "expected a string"))?
        .to_string();

    let keys = obj
        .get(TRUSTED_BIDDING_KEYS_KEY)
        .and_then(Value::as_array)
        .ok_or_else(|| JsonShapeError::new(TRUSTED_BIDDING_KEYS_KEY, "expected an array"))?;

    let trusted_bidding_keys = keys
        .iter()
        .filter_map(|key| match key.as_str() {
            Some(key) => Some(key.to_string()),
            None => {
                tracing::debug!(?key, "Skipping non-string trusted bidding key");
                None
            }
        })
        .collect();

    Ok(TrustedBiddingData {
        trusted_bidding_uri,
        trusted_bidding_keys,
    })
}

/// Reads one ad; `render_uri` must be a string and `metadata` an object.
pub fn read_ad(value: &Value, options: &AdReadOptions) -> Result<AdData, JsonShapeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| JsonShapeError::new(ADS_KEY, "ad entry is not a JSON object"))?;

    let render_uri = obj
        .get(RENDER_URI_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| JsonShapeError::new(RENDER_URI_KEY, "expected a string"))?
        .to_string();

    let metadata = obj
        .get(METADATA_KEY)
        .filter(|m| m.is_object())
        .cloned()
        .ok_or_else(|| JsonShapeError::new(METADATA_KEY, "expected a JSON object"))?;

    let mut ad = AdData {
        render_uri,
        metadata,
        ad_counter_keys: Vec::new(),
        ad_filters: None,
        ad_render_id: None,
    };

    if options.frequency_cap_filtering {
        if let Some(keys) = obj.get(AD_COUNTER_KEYS_KEY) {
            ad.ad_counter_keys = read_ad_counter_keys(keys)?;
        }
    }

    if let Some(filters) = obj.get(AD_FILTERS_KEY) {
        let filters = read_ad_filters(filters, options)?;
        if !filters.is_empty() {
            ad.ad_filters = Some(filters);
        }
    }

    if options.ad_render_id {
        if let Some(id) = obj.get(AD_RENDER_ID_KEY) {
            let id = read_string(AD_RENDER_ID_KEY, id)?;
            if id.len() > options.ad_render_id_max_length {
                tracing::debug!(
                    length = id.len(),
                    max = options.ad_render_id_max_length,
                    "Dropping ad render id exceeding max length"
                );
            } else {
                ad.ad_render_id = Some(id);
            }
        }
    }

    Ok(ad)
}

/// Reads an ad list where any malformed ad fails the whole list.
pub fn read_ads_strict(value: &Value, options: &AdReadOptions) -> Result<Vec<AdData>, JsonShapeError> {
    let ads = value
        .as_array()
        .ok_or_else(|| JsonShapeError::new(ADS_KEY, "expected an array"))?;
    ads.iter().map(|ad| read_ad(ad, options)).collect()
}

/// Reads an ad list, skipping malformed entries.
pub fn read_ads_lenient(
    value: &Value,
    options: &AdReadOptions,
) -> Result<Vec<AdData>, JsonShapeError> {
    let ads = value
        .as_array()
        .ok_or_else(|| JsonShapeError::new(ADS_KEY, "expected an array"))?;
    Ok(ads
        .iter()
        .enumerate()
        .filter_map(|(index, ad)| match read_ad(ad, options) {
            Ok(ad) => Some(ad),
            Err(err) => {
                tracing::debug!(index, error = %err, "Skipping malformed ad");
                None
            }
        })
        .collect())
}

fn read_ad_counter_keys(value: &Value) -> Result<Vec<i32>, JsonShapeError> {
    let keys = value
        .as_array()
        .ok_or_else(|| JsonShapeError::new(AD_COUNTER_KEYS_KEY, "expected an array"))?;
    keys.iter()
        .map(|key| {
            key.as_i64()
                .and_then(|k| i32::try_from(k).ok())
                .ok_or_else(|| JsonShapeError::new(AD_COUNTER_KEYS_KEY, "expected 32-bit integers"))
        })
        .collect()
}

fn read_ad_filters(value: &Value, options: &AdReadOptions) -> Result<AdFilters, JsonShapeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| JsonShapeError::new(AD_FILTERS_KEY, "expected a JSON object"))?;

    let mut filters = AdFilters::default();

    if options.app_install_filtering {
        if let Some(app_install) = obj.get("app_install") {
            let package_names = app_install
                .get("package_names")
                .and_then(Value::as_array)
                .ok_or_else(|| JsonShapeError::new("app_install", "expected package_names array"))?
                .iter()
                .map(|name| read_string("package_names", name))
                .collect::<Result<Vec<_>, _>>()?;
            filters.app_install = Some(AppInstallFilters { package_names });
        }
    }

    if options.frequency_cap_filtering {
        if let Some(frequency_cap) = obj.get("frequency_cap") {
            if !frequency_cap.is_object() {
                return Err(JsonShapeError::new("frequency_cap", "expected a JSON object"));
            }
            filters.frequency_cap = Some(frequency_cap.clone());
        }
    }

    Ok(filters)
}

/// Reads a partial audience; `name` is required, other keys are optional.
pub fn read_partial_custom_audience(value: &Value) -> Result<PartialCustomAudience, JsonShapeError> {
    let obj = value
        .as_object()
        .ok_or_else(|| JsonShapeError::new("partial_custom_audience", "expected a JSON object"))?;

    let name = obj
        .get("name")
        .ok_or_else(|| JsonShapeError::new("name", "missing"))
        .and_then(|v| read_string("name", v))?;

    let optional_time = |key: &str| obj.get(key).map(|v| read_time(key, v)).transpose();

    Ok(PartialCustomAudience {
        name,
        activation_time: optional_time("activation_time")?,
        expiration_time: optional_time("expiration_time")?,
        user_bidding_signals: obj
            .get(USER_BIDDING_SIGNALS_KEY)
            .map(read_user_bidding_signals)
            .transpose()?,
    })
}

pub fn ads_to_json(ads: &[AdData]) -> Value {
    Value::Array(
        ads.iter()
            .map(|ad| serde_json::to_value(ad).unwrap_or(Value::Null))
            .collect(),
    )
}

pub fn trusted_bidding_data_to_json(data: &TrustedBiddingData) -> Value {
    let mut obj = Map::new();
    obj.insert(
        TRUSTED_BIDDING_URI_KEY.to_string(),
        Value::String(data.trusted_bidding_uri.clone()),
    );
    obj.insert(
        TRUSTED_BIDDING_KEYS_KEY.to_string(),
        Value::Array(
            data.trusted_bidding_keys
                .iter()
                .cloned()
                .map(Value::String)
                .collect(),
        ),
    );
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_enabled() -> AdReadOptions {
        AdReadOptions {
            frequency_cap_filtering: true,
            app_install_filtering: true,
            ad_render_id: true,
            ad_render_id_max_length: 12,
        }
    }

    #[test]
    fn test_read_ad_requires_string_render_uri_and_object_metadata() {
        let options = AdReadOptions::default();
        assert!(read_ad(&json!({"render_uri": 5, "metadata": {}}), &options).is_err());
        assert!(read_ad(&json!({"render_uri": "https://b.com/1", "metadata": "x"}), &options).is_err());
        let ad = read_ad(&json!({"render_uri": "https://b.com/1", "metadata": {"k": 1}}), &options)
            .unwrap();
        assert_eq!(ad.render_uri, "https://b.com/1");
        assert_eq!(ad.metadata, json!({"k": 1}));
    }

    #[test]
    fn test_optional_ad_fields_follow_flags() {
        let raw = json!({
            "render_uri": "https://b.com/1",
            "metadata": {},
            "ad_counter_keys": [1, 2],
            "ad_filters": {"app_install": {"package_names": ["com.app"]}},
            "ad_render_id": "abc"
        });

        let plain = read_ad(&raw, &AdReadOptions::default()).unwrap();
        assert!(plain.ad_counter_keys.is_empty());
        assert!(plain.ad_filters.is_none());
        assert!(plain.ad_render_id.is_none());

        let full = read_ad(&raw, &all_enabled()).unwrap();
        assert_eq!(full.ad_counter_keys, vec![1, 2]);
        assert_eq!(
            full.ad_filters.unwrap().app_install.unwrap().package_names,
            vec!["com.app".to_string()]
        );
        assert_eq!(full.ad_render_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_overlong_render_id_is_dropped() {
        let raw = json!({
            "render_uri": "https://b.com/1",
            "metadata": {},
            "ad_render_id": "0123456789abcdef"
        });
        let ad = read_ad(&raw, &all_enabled()).unwrap();
        assert!(ad.ad_render_id.is_none());
    }

    #[test]
    fn test_strict_and_lenient_ad_lists() {
        let raw = json!([
            {"render_uri": "https://b.com/1", "metadata": {}},
            {"render_uri": 1, "metadata": {}}
        ]);
        assert!(read_ads_strict(&raw, &AdReadOptions::default()).is_err());
        assert_eq!(
            read_ads_lenient(&raw, &AdReadOptions::default()).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_trusted_bidding_data_skips_non_string_keys() {
        let data = read_trusted_bidding_data(&json!({
            "trusted_bidding_uri": "https://b.com/tbd",
            "trusted_bidding_keys": ["a", 1, "b"]
        }))
        .unwrap();
        assert_eq!(data.trusted_bidding_keys, vec!["a", "b"]);
        assert_eq!(trusted_bidding_data_to_json(&data)["trusted_bidding_uri"], "https://b.com/tbd");
    }

    #[test]
    fn test_read_partial_custom_audience() {
        let partial = read_partial_custom_audience(&json!({
            "name": "shoes",
            "expiration_time": 1_700_000_000_000i64,
            "user_bidding_signals": {"a": 1}
        }))
        .unwrap();
        assert_eq!(partial.name, "shoes");
        assert!(partial.activation_time.is_none());
        assert_eq!(
            partial.expiration_time.unwrap().timestamp_millis(),
            1_700_000_000_000
        );

        assert!(read_partial_custom_audience(&json!({"expiration_time": 1})).is_err());
        assert!(read_partial_custom_audience(&json!({"name": "x", "user_bidding_signals": 1})).is_err());
        assert!(read_partial_custom_audience(&json!("x")).is_err());
    }

    #[test]
    fn test_omit_ads_flag_names() {
        assert!(AuctionServerRequestFlags::default().names().is_empty());
        assert_eq!(
            AuctionServerRequestFlags(AuctionServerRequestFlags::OMIT_ADS).names(),
            vec![OMIT_ADS_VALUE]
        );
    }
}
