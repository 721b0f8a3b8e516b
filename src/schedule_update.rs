//! # Scheduling API
//!
//! First-hop entry point that records a delayed update for an owner. The
//! update runs once its scheduled time passes, see
//! [`crate::scheduled_updates`].

use std::sync::Arc;

use chrono::Duration;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::access::{AccessPolicy, BuyerResolutionError, resolve_buyer};
use crate::audience::PartialCustomAudience;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::StoreError;
use crate::http_fetcher::DevContext;
use crate::store::{ScheduledUpdate, ScheduledUpdateStore};
use crate::throttle::OwnerThrottle;

pub const MIN_DELAY_MINUTES: i64 = 30;
pub const MAX_DELAY_MINUTES: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("delay of {value} minutes is outside [{min}, {max}]")]
pub struct DelayError {
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

/// Checks a requested delay against `[max(30, override), 300]` minutes.
pub fn validate_delay(min_delay_minutes: i64, override_minutes: i64) -> Result<Duration, DelayError> {
    let min = MIN_DELAY_MINUTES.max(override_minutes);
    if (min..=MAX_DELAY_MINUTES).contains(&min_delay_minutes) {
        Ok(Duration::minutes(min_delay_minutes))
    } else {
        Err(DelayError {
            value: min_delay_minutes,
            min,
            max: MAX_DELAY_MINUTES,
        })
    }
}

/// Result codes reported to callers of the scheduling API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleResultCode {
    Success,
    InvalidArgument,
    RateLimitReached,
    UpdateAlreadyPending,
    InternalError,
}

impl ScheduleResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleResultCode::Success => "SUCCESS",
            ScheduleResultCode::InvalidArgument => "INVALID_ARGUMENT",
            ScheduleResultCode::RateLimitReached => "RATE_LIMIT_REACHED",
            ScheduleResultCode::UpdateAlreadyPending => "UPDATE_ALREADY_PENDING",
            ScheduleResultCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleUpdateError {
    #[error("scheduling custom audience updates is disabled")]
    Disabled,
    #[error("owner {0} is not allowed to schedule updates")]
    OwnerNotAllowed(String),
    #[error("owner {0} exceeded the scheduling rate")]
    RateLimited(String),
    #[error(transparent)]
    InvalidBuyer(#[from] BuyerResolutionError),
    #[error(transparent)]
    InvalidDelay(#[from] DelayError),
    #[error("an update is already pending for owner {owner} and buyer {buyer}")]
    AlreadyPending { owner: String, buyer: String },
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ScheduleUpdateError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::PendingUpdateExists { owner, buyer } => {
                ScheduleUpdateError::AlreadyPending { owner, buyer }
            }
            other => ScheduleUpdateError::Store(other),
        }
    }
}

impl ScheduleUpdateError {
    pub fn code(&self) -> ScheduleResultCode {
        match self {
            ScheduleUpdateError::Disabled | ScheduleUpdateError::Store(_) => {
                ScheduleResultCode::InternalError
            }
            ScheduleUpdateError::RateLimited(_) => ScheduleResultCode::RateLimitReached,
            ScheduleUpdateError::OwnerNotAllowed(_)
            | ScheduleUpdateError::InvalidBuyer(_)
            | ScheduleUpdateError::InvalidDelay(_) => ScheduleResultCode::InvalidArgument,
            ScheduleUpdateError::AlreadyPending { .. } => ScheduleResultCode::UpdateAlreadyPending,
        }
    }
}

/// A first-hop schedule request.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleUpdateInput {
    pub owner: String,
    pub update_uri: String,
    pub min_delay_minutes: i64,
    pub partial_custom_audiences: Vec<PartialCustomAudience>,
    pub should_replace_pending_updates: bool,
}

pub struct ScheduleCustomAudienceUpdateService {
    config: Arc<AppConfig>,
    store: Arc<dyn ScheduledUpdateStore>,
    policy: Arc<dyn AccessPolicy>,
    throttle: OwnerThrottle,
    clock: Arc<dyn Clock>,
}

impl ScheduleCustomAudienceUpdateService {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ScheduledUpdateStore>,
        policy: Arc<dyn AccessPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let throttle = OwnerThrottle::new(config.scheduled_updates.permits_per_second);
        Self {
            config,
            store,
            policy,
            throttle,
            clock,
        }
    }

    /// Validates and persists a delayed update.
    ///
    /// The stored update may carry schedule requests of its own in its
    /// response when nested scheduling is enabled.
    #[instrument(skip_all, fields(owner = %input.owner))]
    pub async fn schedule_update(
        &self,
        input: ScheduleUpdateInput,
        dev: DevContext,
    ) -> Result<ScheduledUpdate, ScheduleUpdateError> {
        let result = self.try_schedule(input, dev).await;
        let code = match &result {
            Ok(_) => ScheduleResultCode::Success,
            Err(err) => err.code(),
        };
        counter!("schedule_update_requests_total", "result" => code.as_str()).increment(1);
        result
    }

    async fn try_schedule(
        &self,
        input: ScheduleUpdateInput,
        dev: DevContext,
    ) -> Result<ScheduledUpdate, ScheduleUpdateError> {
        let settings = &self.config.scheduled_updates;
        if !settings.enabled {
            return Err(ScheduleUpdateError::Disabled);
        }

        if !self.policy.is_owner_allowed(&input.owner) {
            return Err(ScheduleUpdateError::OwnerNotAllowed(input.owner));
        }

        if !self.throttle.try_acquire(&input.owner) {
            return Err(ScheduleUpdateError::RateLimited(input.owner));
        }

        let buyer = resolve_buyer(
            &input.update_uri,
            self.policy.as_ref(),
            self.config.features.enrollment_check_disabled,
        )?;
        let delay = validate_delay(input.min_delay_minutes, settings.min_delay_mins_override)?;

        let now = self.clock.now();
        let mut update =
            ScheduledUpdate::new(&input.owner, &buyer, &input.update_uri, now, now + delay);
        update.allow_schedule_in_response = settings.additional_schedule_requests_enabled;
        update.is_debuggable = dev.dev_options_enabled;

        if let Err(err) = self
            .store
            .insert_scheduled_update(
                &update,
                &input.partial_custom_audiences,
                &[],
                input.should_replace_pending_updates,
            )
            .await
        {
            warn!(buyer = %buyer, error = ?err, "Failed to persist scheduled update");
            return Err(err.into());
        }

        info!(
            buyer = %buyer,
            update_id = %update.id,
            scheduled_time = %update.scheduled_time,
            overrides = input.partial_custom_audiences.len(),
            "Scheduled custom audience update"
        );
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAccessPolicy;
    use crate::clock::FixedClock;
    use crate::repositories::ScheduledUpdateRepository;
    use chrono::Utc;

    #[test]
    fn test_delay_window() {
        assert_eq!(validate_delay(30, 0), Ok(Duration::minutes(30)));
        assert_eq!(validate_delay(300, 0), Ok(Duration::minutes(300)));
        assert!(validate_delay(10, 0).is_err());
        assert!(validate_delay(301, 0).is_err());

        let err = validate_delay(45, 60).unwrap_err();
        assert_eq!(err.min, 60);
        assert!(validate_delay(60, 60).is_ok());
    }

    async fn service(config: AppConfig) -> (ScheduleCustomAudienceUpdateService, Arc<ScheduledUpdateRepository>) {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        let store = Arc::new(ScheduledUpdateRepository::new(db));
        let service = ScheduleCustomAudienceUpdateService::new(
            Arc::new(config),
            store.clone(),
            Arc::new(StaticAccessPolicy::default()),
            Arc::new(FixedClock::new(Utc::now())),
        );
        (service, store)
    }

    fn input(owner: &str) -> ScheduleUpdateInput {
        ScheduleUpdateInput {
            owner: owner.to_string(),
            update_uri: "https://buyer.com/update".to_string(),
            min_delay_minutes: 30,
            partial_custom_audiences: vec![PartialCustomAudience {
                name: "shoes".to_string(),
                ..Default::default()
            }],
            should_replace_pending_updates: false,
        }
    }

    #[tokio::test]
    async fn test_schedule_persists_update() {
        let (service, store) = service(AppConfig::default()).await;

        let update = service
            .schedule_update(input("com.owner"), DevContext::for_debuggable(true))
            .await
            .unwrap();

        assert_eq!(update.buyer, "buyer.com");
        assert!(update.is_debuggable);
        assert!(update.allow_schedule_in_response);
        assert_eq!(update.scheduled_time - update.creation_time, Duration::minutes(30));
        assert_eq!(store.count_pending_for("com.owner", "buyer.com").await.unwrap(), 1);
        assert_eq!(store.get_overrides_for(update.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_result_codes() {
        let mut config = AppConfig::default();
        config.scheduled_updates.permits_per_second = 100.0;
        let (service, _) = service(config).await;

        let mut short = input("com.a");
        short.min_delay_minutes = 10;
        let err = service.schedule_update(short, DevContext::disabled()).await.unwrap_err();
        assert_eq!(err.code(), ScheduleResultCode::InvalidArgument);

        let mut hostless = input("com.a");
        hostless.update_uri = "buyer".to_string();
        let err = service.schedule_update(hostless, DevContext::disabled()).await.unwrap_err();
        assert_eq!(err.code(), ScheduleResultCode::InvalidArgument);

        service.schedule_update(input("com.a"), DevContext::disabled()).await.unwrap();
        let err = service
            .schedule_update(input("com.a"), DevContext::disabled())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ScheduleResultCode::UpdateAlreadyPending);

        let mut replace = input("com.a");
        replace.should_replace_pending_updates = true;
        assert!(service.schedule_update(replace, DevContext::disabled()).await.is_ok());
    }

    #[tokio::test]
    async fn test_throttled_owner_is_rate_limited() {
        let (service, _) = service(AppConfig::default()).await;

        service.schedule_update(input("com.a"), DevContext::disabled()).await.unwrap();
        let err = service
            .schedule_update(input("com.a"), DevContext::disabled())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ScheduleResultCode::RateLimitReached);
    }

    #[tokio::test]
    async fn test_disabled_feature_is_internal_error() {
        let mut config = AppConfig::default();
        config.scheduled_updates.enabled = false;
        let (service, _) = service(config).await;

        let err = service
            .schedule_update(input("com.a"), DevContext::disabled())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ScheduleResultCode::InternalError);
    }
}
