//! Validators for individual audience fields. Sizes are UTF-8 byte lengths.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value;
use url::{Host, Url};

use super::Validator;
use crate::audience::{AdData, TrustedBiddingData};

fn domain_pattern() -> Option<&'static Regex> {
    static DOMAIN: OnceLock<Option<Regex>> = OnceLock::new();
    DOMAIN
        .get_or_init(|| {
            Regex::new(
                r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$",
            )
            .ok()
        })
        .as_ref()
}

pub struct NameValidator {
    pub max_bytes: usize,
}

impl Validator<str> for NameValidator {
    fn add_violations(&self, name: &str, violations: &mut Vec<String>) {
        if name.len() > self.max_bytes {
            violations.push(format!(
                "name is {} bytes, the maximum is {}",
                name.len(),
                self.max_bytes
            ));
        }
    }
}

pub struct UserBiddingSignalsValidator {
    pub max_bytes: usize,
}

impl Validator<Value> for UserBiddingSignalsValidator {
    fn add_violations(&self, signals: &Value, violations: &mut Vec<String>) {
        let size = signals.to_string().len();
        if size > self.max_bytes {
            violations.push(format!(
                "user bidding signals are {size} bytes, the maximum is {}",
                self.max_bytes
            ));
        }
    }
}

pub struct ActivationTimeValidator {
    pub now: DateTime<Utc>,
    pub max_delay: Duration,
}

impl Validator<DateTime<Utc>> for ActivationTimeValidator {
    fn add_violations(&self, activation: &DateTime<Utc>, violations: &mut Vec<String>) {
        let latest = self.now + self.max_delay;
        if *activation > latest {
            violations.push(format!(
                "activation time {activation} is later than the allowed {latest}"
            ));
        }
    }
}

/// `calculated_activation` is the audience's activation time, or now when
/// it has none.
pub struct ExpirationTimeValidator {
    pub now: DateTime<Utc>,
    pub calculated_activation: DateTime<Utc>,
    pub max_expire_in: Duration,
}

impl Validator<DateTime<Utc>> for ExpirationTimeValidator {
    fn add_violations(&self, expiration: &DateTime<Utc>, violations: &mut Vec<String>) {
        if *expiration <= self.now {
            violations.push(format!("expiration time {expiration} has already passed"));
        }
        if *expiration <= self.calculated_activation {
            violations.push(format!(
                "expiration time {expiration} is not after activation time {}",
                self.calculated_activation
            ));
        }
        let latest = self.calculated_activation + self.max_expire_in;
        if *expiration > latest {
            violations.push(format!(
                "expiration time {expiration} is later than the allowed {latest}"
            ));
        }
    }
}

/// Buyers are lowercase host names or IP addresses.
pub struct BuyerValidator;

impl Validator<str> for BuyerValidator {
    fn add_violations(&self, buyer: &str, violations: &mut Vec<String>) {
        let valid = match Host::parse(buyer) {
            Ok(Host::Domain(domain)) => {
                domain == buyer && domain_pattern().is_some_and(|re| re.is_match(buyer))
            }
            Ok(Host::Ipv4(_)) | Ok(Host::Ipv6(_)) => true,
            Err(_) => false,
        };
        if !valid {
            violations.push(format!("buyer '{buyer}' is not a valid host name"));
        }
    }
}

/// A URI served by the buyer: bounded in size, absolute, and hosted on the
/// buyer's domain when the buyer is known.
pub struct BuyerUriValidator<'a> {
    pub field: &'static str,
    pub buyer: Option<&'a str>,
    pub max_bytes: usize,
}

impl Validator<str> for BuyerUriValidator<'_> {
    fn add_violations(&self, uri: &str, violations: &mut Vec<String>) {
        if uri.len() > self.max_bytes {
            violations.push(format!(
                "{} is {} bytes, the maximum is {}",
                self.field,
                uri.len(),
                self.max_bytes
            ));
        }
        check_buyer_host(self.field, uri, self.buyer, violations);
    }
}

pub struct TrustedBiddingDataValidator<'a> {
    pub buyer: Option<&'a str>,
    pub max_bytes: usize,
}

impl Validator<TrustedBiddingData> for TrustedBiddingDataValidator<'_> {
    fn add_violations(&self, data: &TrustedBiddingData, violations: &mut Vec<String>) {
        let size = data.trusted_bidding_uri.len()
            + data
                .trusted_bidding_keys
                .iter()
                .map(String::len)
                .sum::<usize>();
        if size > self.max_bytes {
            violations.push(format!(
                "trusted bidding data is {size} bytes, the maximum is {}",
                self.max_bytes
            ));
        }
        check_buyer_host(
            "trusted bidding URI",
            &data.trusted_bidding_uri,
            self.buyer,
            violations,
        );
    }
}

pub struct AdsValidator {
    pub max_count: usize,
    pub max_bytes: usize,
}

impl Validator<[AdData]> for AdsValidator {
    fn add_violations(&self, ads: &[AdData], violations: &mut Vec<String>) {
        if ads.len() > self.max_count {
            violations.push(format!(
                "{} ads exceed the maximum of {}",
                ads.len(),
                self.max_count
            ));
        }

        let size: usize = ads.iter().map(AdData::size_bytes).sum();
        if size > self.max_bytes {
            violations.push(format!(
                "ads are {size} bytes, the maximum is {}",
                self.max_bytes
            ));
        }

        for (index, ad) in ads.iter().enumerate() {
            if Url::parse(&ad.render_uri).is_err() {
                violations.push(format!("ad {index} has an invalid render URI"));
            }
        }
    }
}

fn check_buyer_host(field: &str, uri: &str, buyer: Option<&str>, violations: &mut Vec<String>) {
    let url = match Url::parse(uri) {
        Ok(url) => url,
        Err(_) => {
            violations.push(format!("{field} '{uri}' is not an absolute URI"));
            return;
        }
    };

    if let Some(buyer) = buyer {
        let host = url.host_str().unwrap_or_default();
        if !host.eq_ignore_ascii_case(buyer) {
            violations.push(format!(
                "{field} host '{host}' does not match buyer '{buyer}'"
            ));
        }
    }
}
