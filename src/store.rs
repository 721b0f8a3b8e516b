//! # Store Interfaces
//!
//! The persistence operations the fetch and scheduled-update pipelines rely
//! on. The SeaORM repositories in [`crate::repositories`] implement them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::audience::{CustomAudience, PartialCustomAudience};
use crate::error::StoreError;
use crate::updatable_data::{UpdatableData, UpdateResultType};

/// Fetch bookkeeping for one audience.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchBookkeeping {
    pub owner: String,
    pub buyer: String,
    pub name: String,
    pub daily_update_uri: String,
    pub eligible_update_time: DateTime<Utc>,
    pub num_validation_failures: i64,
    pub num_timeout_failures: i64,
    pub is_debuggable: bool,
}

impl FetchBookkeeping {
    /// Next bookkeeping state after an attempt; the audience becomes eligible
    /// again one interval after the attempt whatever the outcome.
    pub fn after_attempt(&self, data: &UpdatableData, interval: Duration) -> Self {
        let mut next = self.clone();
        next.eligible_update_time = data.attempted_update_time + interval;
        match data.result_type() {
            UpdateResultType::Success => {
                next.num_validation_failures = 0;
                next.num_timeout_failures = 0;
            }
            UpdateResultType::NetworkFailure => next.num_timeout_failures += 1,
            UpdateResultType::Unknown | UpdateResultType::ValidationFailure => {
                next.num_validation_failures += 1
            }
        }
        next
    }
}

/// Rows removed by one garbage-collection step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeletionStats {
    pub audiences_removed: u64,
    pub fetch_rows_removed: u64,
}

/// A persisted scheduled update.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledUpdate {
    pub id: Uuid,
    pub owner: String,
    pub buyer: String,
    pub update_uri: String,
    pub creation_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub allow_schedule_in_response: bool,
    pub is_debuggable: bool,
}

impl ScheduledUpdate {
    pub fn new(
        owner: impl Into<String>,
        buyer: impl Into<String>,
        update_uri: impl Into<String>,
        creation_time: DateTime<Utc>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            buyer: buyer.into(),
            update_uri: update_uri.into(),
            creation_time,
            scheduled_time,
            allow_schedule_in_response: false,
            is_debuggable: false,
        }
    }
}

#[async_trait]
pub trait CustomAudienceStore: Send + Sync {
    /// Bookkeeping rows due for a refresh at `before`, oldest first.
    async fn get_eligible_for_update(
        &self,
        before: DateTime<Utc>,
        max_rows: u64,
    ) -> Result<Vec<FetchBookkeeping>, StoreError>;

    /// Adopts every payload group present in `data` and stores `row`.
    async fn overwrite_audience_and_bookkeeping(
        &self,
        row: &FetchBookkeeping,
        data: &UpdatableData,
    ) -> Result<(), StoreError>;

    async fn overwrite_bookkeeping_only(&self, row: &FetchBookkeeping) -> Result<(), StoreError>;

    /// Removes audiences whose expiration is at or before `before`.
    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<DeletionStats, StoreError>;

    async fn delete_disallowed_owners(&self) -> Result<DeletionStats, StoreError>;

    async fn delete_disallowed_buyers(&self) -> Result<DeletionStats, StoreError>;

    /// Removes app-install filter entries for packages no longer allowed.
    async fn delete_disallowed_app_install_entries(&self) -> Result<u64, StoreError>;

    /// Returns whether an audience was removed.
    async fn delete_audience_by_key(
        &self,
        owner: &str,
        buyer: &str,
        name: &str,
    ) -> Result<bool, StoreError>;

    /// Inserts or replaces an audience together with its bookkeeping row,
    /// subject to the configured quantity limits.
    async fn overwrite_audience(
        &self,
        audience: &CustomAudience,
        daily_update_uri: &str,
        is_debuggable: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn find_audience(
        &self,
        owner: &str,
        buyer: &str,
        name: &str,
    ) -> Result<Option<CustomAudience>, StoreError>;

    async fn find_bookkeeping(
        &self,
        owner: &str,
        buyer: &str,
        name: &str,
    ) -> Result<Option<FetchBookkeeping>, StoreError>;
}

#[async_trait]
pub trait ScheduledUpdateStore: Send + Sync {
    /// Updates whose scheduled time is at or before `before`.
    async fn get_due_scheduled_updates(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledUpdate>, StoreError>;

    async fn get_overrides_for(
        &self,
        update_id: Uuid,
    ) -> Result<Vec<PartialCustomAudience>, StoreError>;

    async fn get_leave_names_for(&self, update_id: Uuid) -> Result<Vec<String>, StoreError>;

    /// Persists an update with its overrides and leave names in one
    /// transaction. Pending updates for the same owner and buyer are removed
    /// when `replace_pending` is set, otherwise their presence is a conflict.
    async fn insert_scheduled_update(
        &self,
        update: &ScheduledUpdate,
        overrides: &[PartialCustomAudience],
        leave_names: &[String],
        replace_pending: bool,
    ) -> Result<(), StoreError>;

    async fn delete_scheduled_update(&self, update_id: Uuid) -> Result<(), StoreError>;

    /// Drops updates created before `before`; returns how many were removed.
    async fn delete_updates_created_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
