//! # Scheduled Updates
//!
//! Executes delayed updates once they are due. Each update POSTs its validated
//! partial audiences to the buyer, leaves the audiences the response names,
//! joins the audiences the response carries (fused with the matching partial
//! audience) and, when allowed, records the further updates the response
//! requests. Updates are independent: one failing leaves the others alone.

pub mod schedule_requests;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use crate::access::{AccessPolicy, resolve_buyer};
use crate::audience_blob::{AudienceBlob, BlobError, BlobOptions};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::{PipelineError, StoreError};
use crate::http_fetcher::{DevContext, FetchError, HttpFetcher};
use crate::schedule_update::validate_delay;
use crate::store::{CustomAudienceStore, ScheduledUpdate, ScheduledUpdateStore};
use crate::validation::{AudienceBlobValidator, ValidationError};

use schedule_requests::{
    ScheduleRequestError, extract_schedule_requests, parse_schedule_request, request_body,
};

pub use worker::ScheduledUpdatesWorker;

pub const JOIN_KEY: &str = "join";
pub const LEAVE_KEY: &str = "leave";

/// Outcome of one handled update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct UpdatePerformedStats {
    pub partial_audiences_in_request: u64,
    pub leave_in_response: u64,
    pub audiences_left: u64,
    pub join_in_response: u64,
    pub audiences_joined: u64,
    pub join_failures: u64,
    pub leave_failures: u64,
    pub schedule_requests_in_response: u64,
    pub schedule_requests_inserted: u64,
    pub schedule_request_failures: u64,
}

/// Outcome of one scheduled-update run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ScheduledUpdateRunStats {
    pub stale_removed: u64,
    pub updates_found: u64,
    pub updates_succeeded: u64,
    pub updates_failed: u64,
    pub audiences_joined: u64,
    pub audiences_left: u64,
    pub join_failures: u64,
    pub leave_failures: u64,
    pub schedule_requests_inserted: u64,
    /// A stop request left some due updates unfetched and pending.
    pub stopped_early: bool,
}

impl ScheduledUpdateRunStats {
    fn record(&mut self, performed: &UpdatePerformedStats) {
        self.updates_succeeded += 1;
        self.audiences_joined += performed.audiences_joined;
        self.audiences_left += performed.audiences_left;
        self.join_failures += performed.join_failures;
        self.leave_failures += performed.leave_failures;
        self.schedule_requests_inserted += performed.schedule_requests_inserted;
    }
}

/// Failure of a single update; the update stays pending.
#[derive(Debug, Error)]
enum UpdateError {
    #[error("fetching the update failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("update response is not a JSON object")]
    InvalidResponse,
    #[error("stop requested before the update was fetched")]
    Stopped,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
enum JoinError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("fused audience is {size} bytes, the maximum is {max}")]
    TooLarge { size: usize, max: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JoinError {
    fn kind(&self) -> &'static str {
        match self {
            JoinError::Blob(BlobError::Incomplete { .. }) => "incomplete",
            JoinError::Blob(_) => "json_error",
            JoinError::Validation(_) => "validation_error",
            JoinError::TooLarge { .. } => "size_exceeded",
            JoinError::Store(StoreError::QuotaExceeded(_)) => "quota_exceeded",
            JoinError::Store(_) => "internal_error",
        }
    }
}

pub struct ScheduledUpdatesHandler {
    config: Arc<AppConfig>,
    audiences: Arc<dyn CustomAudienceStore>,
    updates: Arc<dyn ScheduledUpdateStore>,
    fetcher: Arc<dyn HttpFetcher>,
    policy: Arc<dyn AccessPolicy>,
    clock: Arc<dyn Clock>,
    validator: AudienceBlobValidator,
    blob_options: BlobOptions,
}

impl ScheduledUpdatesHandler {
    pub fn new(
        config: Arc<AppConfig>,
        audiences: Arc<dyn CustomAudienceStore>,
        updates: Arc<dyn ScheduledUpdateStore>,
        fetcher: Arc<dyn HttpFetcher>,
        policy: Arc<dyn AccessPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            validator: AudienceBlobValidator::new(config.limits.clone()),
            blob_options: BlobOptions::from_config(&config),
            config,
            audiences,
            updates,
            fetcher,
            policy,
            clock,
        }
    }

    /// Runs every update due at `before`, after discarding stale ones.
    ///
    /// Individual update failures are counted, not returned; only a store
    /// failure while listing work fails the run.
    pub async fn perform_scheduled_updates(
        &self,
        before: DateTime<Utc>,
    ) -> Result<ScheduledUpdateRunStats, PipelineError> {
        self.perform(before, &CancellationToken::new()).await
    }

    /// Like [`Self::perform_scheduled_updates`]; updates not yet fetched when
    /// `cancel` fires stay pending for the next run.
    #[instrument(skip_all, fields(before = %before))]
    async fn perform(
        &self,
        before: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScheduledUpdateRunStats, PipelineError> {
        let started = Instant::now();
        let mut stats = ScheduledUpdateRunStats::default();

        let stale_age = Duration::hours(self.config.scheduled_updates.stale_update_age_hours as i64);
        stats.stale_removed = self
            .updates
            .delete_updates_created_before(before - stale_age)
            .await?;

        let due = self.updates.get_due_scheduled_updates(before).await?;
        stats.updates_found = due.len() as u64;
        gauge!("scheduled_updates_due_gauge").set(stats.updates_found as f64);

        if due.is_empty() {
            debug!(stale_removed = stats.stale_removed, "No scheduled updates due");
            return Ok(stats);
        }

        info!(updates = stats.updates_found, "Performing scheduled updates");

        let outcomes = join_all(due.iter().map(|update| self.handle_update(update, cancel))).await;
        for (update, outcome) in due.iter().zip(outcomes) {
            match outcome {
                Ok(performed) => stats.record(&performed),
                Err(UpdateError::Stopped) => stats.stopped_early = true,
                Err(err) => {
                    stats.updates_failed += 1;
                    warn!(
                        update_id = %update.id,
                        owner = %update.owner,
                        buyer = %update.buyer,
                        error = %err,
                        "Scheduled update failed; it stays pending"
                    );
                }
            }
        }

        counter!("scheduled_updates_found_total").increment(stats.updates_found);
        counter!("scheduled_updates_succeeded_total").increment(stats.updates_succeeded);
        histogram!("scheduled_updates_run_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        debug!(
            found = stats.updates_found,
            succeeded = stats.updates_succeeded,
            failed = stats.updates_failed,
            joined = stats.audiences_joined,
            left = stats.audiences_left,
            scheduled = stats.schedule_requests_inserted,
            "Scheduled update run completed"
        );

        Ok(stats)
    }

    #[instrument(skip_all, fields(update_id = %update.id, owner = %update.owner, buyer = %update.buyer))]
    async fn handle_update(
        &self,
        update: &ScheduledUpdate,
        cancel: &CancellationToken,
    ) -> Result<UpdatePerformedStats, UpdateError> {
        let mut stats = UpdatePerformedStats::default();
        let now = self.clock.now();
        let dev = DevContext::for_debuggable(update.is_debuggable);

        let overrides = self.valid_overrides(update, now).await?;
        stats.partial_audiences_in_request = overrides.len() as u64;

        let leave_names = self.updates.get_leave_names_for(update.id).await?;
        let body = request_body(
            &overrides,
            &leave_names,
            self.config.scheduled_updates.additional_schedule_requests_enabled,
        );

        if cancel.is_cancelled() {
            return Err(UpdateError::Stopped);
        }

        let response = match self.fetcher.post(&update.update_uri, &body, dev).await {
            Ok(response) => response,
            Err(err) => {
                counter!("scheduled_update_http_failures_total", "kind" => err.failure_kind().as_str())
                    .increment(1);
                return Err(err.into());
            }
        };
        let response: Map<String, Value> =
            serde_json::from_str(&response).map_err(|_| UpdateError::InvalidResponse)?;

        // Leaving first frees quota for the joins.
        self.leave_audiences(update, &response, &mut stats).await;
        self.join_audiences(update, &overrides, &response, dev, &mut stats)
            .await;

        if self.config.scheduled_updates.additional_schedule_requests_enabled
            && update.allow_schedule_in_response
        {
            self.enqueue_schedule_requests(update, &response, dev, &mut stats)
                .await;
        }

        self.updates.delete_scheduled_update(update.id).await?;

        info!(
            joined = stats.audiences_joined,
            left = stats.audiences_left,
            scheduled = stats.schedule_requests_inserted,
            "Scheduled update performed"
        );
        Ok(stats)
    }

    /// Partial audiences of `update` that pass validation, as blobs seeded
    /// with the update's owner and buyer.
    async fn valid_overrides(
        &self,
        update: &ScheduledUpdate,
        now: DateTime<Utc>,
    ) -> Result<Vec<AudienceBlob>, StoreError> {
        let partials = self.updates.get_overrides_for(update.id).await?;

        let mut blobs = Vec::with_capacity(partials.len());
        for partial in &partials {
            let mut blob = AudienceBlob::new(self.blob_options);
            blob.populate_from_partial(&update.owner, &update.buyer, partial);
            match self.validator.validate(&blob, now) {
                Ok(()) => blobs.push(blob),
                Err(err) => warn!(name = %partial.name, error = %err, "Skipping invalid partial audience"),
            }
        }
        Ok(blobs)
    }

    async fn leave_audiences(
        &self,
        update: &ScheduledUpdate,
        response: &Map<String, Value>,
        stats: &mut UpdatePerformedStats,
    ) {
        let entries: &[Value] = response
            .get(LEAVE_KEY)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        stats.leave_in_response = entries.len() as u64;

        for entry in entries {
            let Some(name) = entry.as_str() else {
                stats.leave_failures += 1;
                counter!("scheduled_update_leave_failures_total", "kind" => "json_error").increment(1);
                warn!(entry = %entry, "Skipping leave entry that is not a string");
                continue;
            };
            match self
                .audiences
                .delete_audience_by_key(&update.owner, &update.buyer, name)
                .await
            {
                Ok(true) => stats.audiences_left += 1,
                Ok(false) => debug!(name = %name, "No custom audience to leave"),
                Err(err) => {
                    stats.leave_failures += 1;
                    counter!("scheduled_update_leave_failures_total", "kind" => "internal_error")
                        .increment(1);
                    warn!(name = %name, error = ?err, "Failed to leave custom audience");
                }
            }
        }
        counter!("scheduled_update_audiences_left_total").increment(stats.audiences_left);
    }

    async fn join_audiences(
        &self,
        update: &ScheduledUpdate,
        overrides: &[AudienceBlob],
        response: &Map<String, Value>,
        dev: DevContext,
        stats: &mut UpdatePerformedStats,
    ) {
        let entries: &[Value] = response
            .get(JOIN_KEY)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        stats.join_in_response = entries.len() as u64;

        let overrides: HashMap<&str, &AudienceBlob> = overrides
            .iter()
            .filter_map(|blob| blob.name().map(|name| (name, blob)))
            .collect();

        for entry in entries {
            match self.join_audience(update, &overrides, entry, dev).await {
                Ok(()) => stats.audiences_joined += 1,
                Err(err) => {
                    stats.join_failures += 1;
                    counter!("scheduled_update_join_failures_total", "kind" => err.kind()).increment(1);
                    warn!(error = %err, "Skipping join entry");
                }
            }
        }
        counter!("scheduled_update_audiences_joined_total").increment(stats.audiences_joined);
    }

    async fn join_audience(
        &self,
        update: &ScheduledUpdate,
        overrides: &HashMap<&str, &AudienceBlob>,
        entry: &Value,
        dev: DevContext,
    ) -> Result<(), JoinError> {
        let mut fused = AudienceBlob::new(self.blob_options);
        fused.populate_from_json(entry)?;
        if let Some(partial) = fused.name().and_then(|name| overrides.get(name)) {
            fused.populate_from_json(&partial.to_json())?;
        }
        if !fused.is_complete() {
            return Err(BlobError::Incomplete {
                missing: fused.missing_canonical_fields(),
            }
            .into());
        }
        fused.set_owner(update.owner.as_str());
        fused.set_buyer(update.buyer.as_str());

        let now = self.clock.now();
        self.validator.validate(&fused, now)?;

        let size = fused.size_bytes();
        let max = self.config.limits.max_custom_audience_size_bytes;
        if size > max {
            return Err(JoinError::TooLarge { size, max });
        }

        let (audience, daily_update_uri) = fused.to_custom_audience()?;
        self.audiences
            .overwrite_audience(&audience, &daily_update_uri, dev.dev_options_enabled, now)
            .await?;

        debug!(name = %audience.name, "Joined custom audience");
        Ok(())
    }

    async fn enqueue_schedule_requests(
        &self,
        update: &ScheduledUpdate,
        response: &Map<String, Value>,
        dev: DevContext,
        stats: &mut UpdatePerformedStats,
    ) {
        let requests = extract_schedule_requests(response);
        stats.schedule_requests_in_response = requests.len() as u64;

        for request in requests {
            match self.insert_schedule_request(update, request, dev).await {
                Ok(next) => {
                    stats.schedule_requests_inserted += 1;
                    debug!(next_update_id = %next.id, buyer = %next.buyer, "Scheduled follow-up update");
                }
                Err(err) => {
                    stats.schedule_request_failures += 1;
                    counter!("scheduled_update_schedule_request_failures_total", "kind" => err.kind())
                        .increment(1);
                    warn!(error = %err, "Skipping schedule request");
                }
            }
        }
    }

    async fn insert_schedule_request(
        &self,
        update: &ScheduledUpdate,
        request: &Map<String, Value>,
        dev: DevContext,
    ) -> Result<ScheduledUpdate, ScheduleRequestError> {
        let request = parse_schedule_request(request)?;
        let buyer = resolve_buyer(
            &request.update_uri,
            self.policy.as_ref(),
            self.config.features.enrollment_check_disabled,
        )?;
        let delay = validate_delay(
            request.min_delay_minutes,
            self.config.scheduled_updates.min_delay_mins_override,
        )?;

        let now = self.clock.now();
        let mut next = ScheduledUpdate::new(&update.owner, buyer, &request.update_uri, now, now + delay);
        next.allow_schedule_in_response = false;
        next.is_debuggable = dev.dev_options_enabled;

        self.updates
            .insert_scheduled_update(
                &next,
                &request.partial_custom_audiences,
                &request.leave_names,
                request.should_replace_pending_updates,
            )
            .await?;
        Ok(next)
    }
}
