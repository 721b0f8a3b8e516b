//! Owner allow-listing and buyer enrollment checks.

use std::collections::HashSet;

use url::Url;

use crate::config::AppConfig;

pub trait AccessPolicy: Send + Sync {
    fn is_owner_allowed(&self, owner: &str) -> bool;

    fn is_buyer_enrolled(&self, buyer: &str) -> bool;
}

/// Policy backed by the configured lists; an empty list allows everything.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessPolicy {
    allowed_owners: HashSet<String>,
    enrolled_buyers: HashSet<String>,
}

impl StaticAccessPolicy {
    pub fn new<O, B>(allowed_owners: O, enrolled_buyers: B) -> Self
    where
        O: IntoIterator<Item = String>,
        B: IntoIterator<Item = String>,
    {
        Self {
            allowed_owners: allowed_owners.into_iter().collect(),
            enrolled_buyers: enrolled_buyers
                .into_iter()
                .map(|b| b.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.allowed_owners.iter().cloned(),
            config.enrolled_buyers.iter().cloned(),
        )
    }
}

impl AccessPolicy for StaticAccessPolicy {
    fn is_owner_allowed(&self, owner: &str) -> bool {
        self.allowed_owners.is_empty() || self.allowed_owners.contains(owner)
    }

    fn is_buyer_enrolled(&self, buyer: &str) -> bool {
        self.enrolled_buyers.is_empty()
            || self.enrolled_buyers.contains(&buyer.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuyerResolutionError {
    #[error("update URI '{0}' is not a valid absolute URI")]
    InvalidUri(String),
    #[error("update URI '{0}' has no host")]
    MissingHost(String),
    #[error("buyer '{0}' is not enrolled")]
    NotEnrolled(String),
}

/// Derives the buyer identifier for an update URI.
///
/// With enrollment checks disabled the URI host is trusted as-is; otherwise
/// the host must belong to an enrolled buyer.
pub fn resolve_buyer(
    update_uri: &str,
    policy: &dyn AccessPolicy,
    enrollment_check_disabled: bool,
) -> Result<String, BuyerResolutionError> {
    let url = Url::parse(update_uri)
        .map_err(|_| BuyerResolutionError::InvalidUri(update_uri.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BuyerResolutionError::MissingHost(update_uri.to_string()))?
        .to_ascii_lowercase();

    if enrollment_check_disabled || policy.is_buyer_enrolled(&host) {
        Ok(host)
    } else {
        Err(BuyerResolutionError::NotEnrolled(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_lists_allow_everything() {
        let policy = StaticAccessPolicy::default();
        assert!(policy.is_owner_allowed("com.any"));
        assert!(policy.is_buyer_enrolled("any.com"));
    }

    #[test]
    fn test_lists_restrict_membership() {
        let policy = StaticAccessPolicy::new(
            vec!["com.allowed".to_string()],
            vec!["Buyer.com".to_string()],
        );
        assert!(policy.is_owner_allowed("com.allowed"));
        assert!(!policy.is_owner_allowed("com.other"));
        assert!(policy.is_buyer_enrolled("buyer.com"));
        assert!(!policy.is_buyer_enrolled("other.com"));
    }

    #[test]
    fn test_resolve_buyer_from_host() {
        let policy = StaticAccessPolicy::new(Vec::new(), vec!["buyer.com".to_string()]);
        assert_eq!(
            resolve_buyer("https://buyer.com/update", &policy, false).unwrap(),
            "buyer.com"
        );
        assert_eq!(
            resolve_buyer("https://other.com/update", &policy, false),
            Err(BuyerResolutionError::NotEnrolled("other.com".to_string()))
        );
        assert_eq!(
            resolve_buyer("https://other.com/update", &policy, true).unwrap(),
            "other.com"
        );
        assert!(matches!(
            resolve_buyer("not a uri", &policy, true),
            Err(BuyerResolutionError::InvalidUri(_))
        ));
    }
}
