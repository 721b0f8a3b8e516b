//! # Custom Audience Repository
//!
//! SeaORM-backed [`CustomAudienceStore`]: audiences, their background-fetch
//! bookkeeping and the garbage-collection queries run before each fetch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::access::{AccessPolicy, StaticAccessPolicy};
use crate::audience::{AdData, AuctionServerRequestFlags, CustomAudience, TrustedBiddingData};
use crate::config::AudienceLimitsConfig;
use crate::error::StoreError;
use crate::models::{app_install_entry, background_fetch_data, custom_audience};
use crate::store::{CustomAudienceStore, DeletionStats, FetchBookkeeping};
use crate::updatable_data::UpdatableData;

/// Ceilings enforced when a new audience key is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantityLimits {
    pub max_total: u64,
    pub max_per_owner: u64,
    pub max_owners: u64,
}

impl QuantityLimits {
    pub fn from_limits(limits: &AudienceLimitsConfig) -> Self {
        Self {
            max_total: limits.max_total_audiences,
            max_per_owner: limits.max_audiences_per_owner,
            max_owners: limits.max_owner_count,
        }
    }
}

impl Default for QuantityLimits {
    fn default() -> Self {
        Self::from_limits(&AudienceLimitsConfig::default())
    }
}

/// Repository for custom audience database operations
pub struct CustomAudienceRepository {
    db: DatabaseConnection,
    policy: Arc<dyn AccessPolicy>,
    quantity_limits: QuantityLimits,
    update_interval: Duration,
}

impl CustomAudienceRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            policy: Arc::new(StaticAccessPolicy::default()),
            quantity_limits: QuantityLimits::default(),
            update_interval: Duration::days(1),
        }
    }

    pub fn with_access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_quantity_limits(mut self, limits: QuantityLimits) -> Self {
        self.quantity_limits = limits;
        self
    }

    /// Delay before a freshly joined audience is refreshed in the background.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Number of stored audiences.
    pub async fn count_audiences(&self) -> Result<u64, StoreError> {
        Ok(custom_audience::Entity::find().count(&self.db).await?)
    }

    /// Records that `buyer` may filter on `package_name`.
    pub async fn insert_app_install_entry(
        &self,
        buyer: &str,
        package_name: &str,
    ) -> Result<(), StoreError> {
        app_install_entry::ActiveModel {
            id: Set(Uuid::new_v4()),
            buyer: Set(buyer.to_string()),
            package_name: Set(package_name.to_string()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn count_app_install_entries(&self) -> Result<u64, StoreError> {
        Ok(app_install_entry::Entity::find().count(&self.db).await?)
    }

    async fn check_quantity<C: ConnectionTrait>(
        &self,
        conn: &C,
        owner: &str,
    ) -> Result<(), StoreError> {
        let limits = self.quantity_limits;

        let total = custom_audience::Entity::find().count(conn).await?;
        if total >= limits.max_total {
            return Err(StoreError::QuotaExceeded(format!(
                "total audience count {total} has reached {}",
                limits.max_total
            )));
        }

        let per_owner = custom_audience::Entity::find()
            .filter(custom_audience::Column::Owner.eq(owner))
            .count(conn)
            .await?;
        if per_owner >= limits.max_per_owner {
            return Err(StoreError::QuotaExceeded(format!(
                "owner {owner} already holds {per_owner} audiences"
            )));
        }

        if per_owner == 0 {
            let owners = distinct_owners(conn).await?.len() as u64;
            if owners >= limits.max_owners {
                return Err(StoreError::QuotaExceeded(format!(
                    "owner count {owners} has reached {}",
                    limits.max_owners
                )));
            }
        }

        Ok(())
    }

    async fn delete_keys<C: ConnectionTrait>(
        conn: &C,
        keys: &[(String, String, String)],
    ) -> Result<DeletionStats, StoreError> {
        let mut stats = DeletionStats::default();
        for (owner, buyer, name) in keys {
            stats.audiences_removed += custom_audience::Entity::delete_many()
                .filter(audience_key(owner, buyer, name))
                .exec(conn)
                .await?
                .rows_affected;
            stats.fetch_rows_removed += background_fetch_data::Entity::delete_many()
                .filter(fetch_key(owner, buyer, name))
                .exec(conn)
                .await?
                .rows_affected;
        }
        Ok(stats)
    }
}

#[async_trait]
impl CustomAudienceStore for CustomAudienceRepository {
    async fn get_eligible_for_update(
        &self,
        before: DateTime<Utc>,
        max_rows: u64,
    ) -> Result<Vec<FetchBookkeeping>, StoreError> {
        let rows = background_fetch_data::Entity::find()
            .filter(background_fetch_data::Column::EligibleUpdateTime.lte(before.fixed_offset()))
            .order_by_asc(background_fetch_data::Column::EligibleUpdateTime)
            .limit(max_rows)
            .all(&self.db)
            .await
            .map_err(|e| {
                tracing::error!("Failed to load audiences eligible for update: {}", e);
                StoreError::from(e)
            })?;

        Ok(rows.into_iter().map(bookkeeping_from_model).collect())
    }

    async fn overwrite_audience_and_bookkeeping(
        &self,
        row: &FetchBookkeeping,
        data: &UpdatableData,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;

        if let Some(existing) = custom_audience::Entity::find()
            .filter(audience_key(&row.owner, &row.buyer, &row.name))
            .one(&txn)
            .await?
        {
            let mut active: custom_audience::ActiveModel = existing.into();
            if let Some(signals) = &data.user_bidding_signals {
                active.user_bidding_signals = Set(Some(signals.clone()));
            }
            if let Some(trusted) = &data.trusted_bidding_data {
                active.trusted_bidding_data = Set(Some(encode("trusted_bidding_data", trusted)?));
            }
            if let Some(ads) = &data.ads {
                active.ads = Set(Some(encode("ads", ads)?));
            }
            active.last_updated = Set(data.attempted_update_time.fixed_offset());
            active.update(&txn).await?;
        } else {
            tracing::debug!(
                owner = %row.owner,
                buyer = %row.buyer,
                name = %row.name,
                "Audience disappeared before its update was stored"
            );
        }

        upsert_bookkeeping(&txn, row).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn overwrite_bookkeeping_only(&self, row: &FetchBookkeeping) -> Result<(), StoreError> {
        upsert_bookkeeping(&self.db, row).await
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<DeletionStats, StoreError> {
        let keys: Vec<(String, String, String)> = custom_audience::Entity::find()
            .select_only()
            .column(custom_audience::Column::Owner)
            .column(custom_audience::Column::Buyer)
            .column(custom_audience::Column::Name)
            .filter(custom_audience::Column::ExpirationTime.lte(before.fixed_offset()))
            .into_tuple()
            .all(&self.db)
            .await?;

        let txn = self.db.begin().await?;
        let stats = Self::delete_keys(&txn, &keys).await?;
        txn.commit().await?;
        Ok(stats)
    }

    async fn delete_disallowed_owners(&self) -> Result<DeletionStats, StoreError> {
        let mut owners = distinct_owners(&self.db).await?;
        let fetch_owners: Vec<String> = background_fetch_data::Entity::find()
            .select_only()
            .column(background_fetch_data::Column::Owner)
            .distinct()
            .into_tuple()
            .all(&self.db)
            .await?;
        owners.extend(fetch_owners);
        owners.sort();
        owners.dedup();

        let disallowed: Vec<String> = owners
            .into_iter()
            .filter(|owner| !self.policy.is_owner_allowed(owner))
            .collect();
        if disallowed.is_empty() {
            return Ok(DeletionStats::default());
        }

        let txn = self.db.begin().await?;
        let audiences_removed = custom_audience::Entity::delete_many()
            .filter(custom_audience::Column::Owner.is_in(disallowed.clone()))
            .exec(&txn)
            .await?
            .rows_affected;
        let fetch_rows_removed = background_fetch_data::Entity::delete_many()
            .filter(background_fetch_data::Column::Owner.is_in(disallowed))
            .exec(&txn)
            .await?
            .rows_affected;
        txn.commit().await?;

        Ok(DeletionStats {
            audiences_removed,
            fetch_rows_removed,
        })
    }

    async fn delete_disallowed_buyers(&self) -> Result<DeletionStats, StoreError> {
        let mut buyers: Vec<String> = custom_audience::Entity::find()
            .select_only()
            .column(custom_audience::Column::Buyer)
            .distinct()
            .into_tuple()
            .all(&self.db)
            .await?;
        let fetch_buyers: Vec<String> = background_fetch_data::Entity::find()
            .select_only()
            .column(background_fetch_data::Column::Buyer)
            .distinct()
            .into_tuple()
            .all(&self.db)
            .await?;
        buyers.extend(fetch_buyers);
        buyers.sort();
        buyers.dedup();

        let unenrolled: Vec<String> = buyers
            .into_iter()
            .filter(|buyer| !self.policy.is_buyer_enrolled(buyer))
            .collect();
        if unenrolled.is_empty() {
            return Ok(DeletionStats::default());
        }

        let txn = self.db.begin().await?;
        let audiences_removed = custom_audience::Entity::delete_many()
            .filter(custom_audience::Column::Buyer.is_in(unenrolled.clone()))
            .exec(&txn)
            .await?
            .rows_affected;
        let fetch_rows_removed = background_fetch_data::Entity::delete_many()
            .filter(background_fetch_data::Column::Buyer.is_in(unenrolled))
            .exec(&txn)
            .await?
            .rows_affected;
        txn.commit().await?;

        Ok(DeletionStats {
            audiences_removed,
            fetch_rows_removed,
        })
    }

    async fn delete_disallowed_app_install_entries(&self) -> Result<u64, StoreError> {
        let packages: Vec<String> = app_install_entry::Entity::find()
            .select_only()
            .column(app_install_entry::Column::PackageName)
            .distinct()
            .into_tuple()
            .all(&self.db)
            .await?;

        let disallowed: Vec<String> = packages
            .into_iter()
            .filter(|package| !self.policy.is_owner_allowed(package))
            .collect();
        if disallowed.is_empty() {
            return Ok(0);
        }

        Ok(app_install_entry::Entity::delete_many()
            .filter(app_install_entry::Column::PackageName.is_in(disallowed))
            .exec(&self.db)
            .await?
            .rows_affected)
    }

    async fn delete_audience_by_key(
        &self,
        owner: &str,
        buyer: &str,
        name: &str,
    ) -> Result<bool, StoreError> {
        let txn = self.db.begin().await?;
        let stats = Self::delete_keys(
            &txn,
            &[(owner.to_string(), buyer.to_string(), name.to_string())],
        )
        .await?;
        txn.commit().await?;
        Ok(stats.audiences_removed > 0)
    }

    async fn overwrite_audience(
        &self,
        audience: &CustomAudience,
        daily_update_uri: &str,
        is_debuggable: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;

        let existing = custom_audience::Entity::find()
            .filter(audience_key(&audience.owner, &audience.buyer, &audience.name))
            .one(&txn)
            .await?;

        if existing.is_none() {
            self.check_quantity(&txn, &audience.owner).await?;
        }

        let now_tz = now.fixed_offset();
        let model = custom_audience::ActiveModel {
            id: Set(existing.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4)),
            owner: Set(audience.owner.clone()),
            buyer: Set(audience.buyer.clone()),
            name: Set(audience.name.clone()),
            activation_time: Set(audience.activation_time.fixed_offset()),
            expiration_time: Set(audience.expiration_time.fixed_offset()),
            bidding_logic_uri: Set(audience.bidding_logic_uri.clone()),
            user_bidding_signals: Set(audience.user_bidding_signals.clone()),
            trusted_bidding_data: Set(audience
                .trusted_bidding_data
                .as_ref()
                .map(|t| encode("trusted_bidding_data", t))
                .transpose()?),
            ads: Set(audience
                .ads
                .as_ref()
                .map(|a| encode("ads", a))
                .transpose()?),
            auction_server_request_flags: Set(audience.auction_server_request_flags.0),
            priority: Set(audience.priority),
            is_debuggable: Set(is_debuggable),
            creation_time: Set(existing
                .as_ref()
                .map(|m| m.creation_time)
                .unwrap_or(now_tz)),
            last_updated: Set(now_tz),
        };

        if existing.is_some() {
            model.update(&txn).await?;
        } else {
            model.insert(&txn).await?;
        }

        let bookkeeping = FetchBookkeeping {
            owner: audience.owner.clone(),
            buyer: audience.buyer.clone(),
            name: audience.name.clone(),
            daily_update_uri: daily_update_uri.to_string(),
            eligible_update_time: now + self.update_interval,
            num_validation_failures: 0,
            num_timeout_failures: 0,
            is_debuggable,
        };
        upsert_bookkeeping(&txn, &bookkeeping).await?;

        txn.commit().await?;

        tracing::debug!(
            owner = %audience.owner,
            buyer = %audience.buyer,
            name = %audience.name,
            "Custom audience stored"
        );
        Ok(())
    }

    async fn find_audience(
        &self,
        owner: &str,
        buyer: &str,
        name: &str,
    ) -> Result<Option<CustomAudience>, StoreError> {
        custom_audience::Entity::find()
            .filter(audience_key(owner, buyer, name))
            .one(&self.db)
            .await?
            .map(audience_from_model)
            .transpose()
    }

    async fn find_bookkeeping(
        &self,
        owner: &str,
        buyer: &str,
        name: &str,
    ) -> Result<Option<FetchBookkeeping>, StoreError> {
        Ok(background_fetch_data::Entity::find()
            .filter(fetch_key(owner, buyer, name))
            .one(&self.db)
            .await?
            .map(bookkeeping_from_model))
    }
}

fn audience_key(owner: &str, buyer: &str, name: &str) -> Condition {
    Condition::all()
        .add(custom_audience::Column::Owner.eq(owner))
        .add(custom_audience::Column::Buyer.eq(buyer))
        .add(custom_audience::Column::Name.eq(name))
}

fn fetch_key(owner: &str, buyer: &str, name: &str) -> Condition {
    Condition::all()
        .add(background_fetch_data::Column::Owner.eq(owner))
        .add(background_fetch_data::Column::Buyer.eq(buyer))
        .add(background_fetch_data::Column::Name.eq(name))
}

async fn distinct_owners<C: ConnectionTrait>(conn: &C) -> Result<Vec<String>, StoreError> {
    Ok(custom_audience::Entity::find()
        .select_only()
        .column(custom_audience::Column::Owner)
        .distinct()
        .into_tuple()
        .all(conn)
        .await?)
}

async fn upsert_bookkeeping<C: ConnectionTrait>(
    conn: &C,
    row: &FetchBookkeeping,
) -> Result<(), StoreError> {
    let existing = background_fetch_data::Entity::find()
        .filter(fetch_key(&row.owner, &row.buyer, &row.name))
        .one(conn)
        .await?;

    let model = background_fetch_data::ActiveModel {
        id: Set(existing.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4)),
        owner: Set(row.owner.clone()),
        buyer: Set(row.buyer.clone()),
        name: Set(row.name.clone()),
        daily_update_uri: Set(row.daily_update_uri.clone()),
        eligible_update_time: Set(row.eligible_update_time.fixed_offset()),
        num_validation_failures: Set(row.num_validation_failures),
        num_timeout_failures: Set(row.num_timeout_failures),
        is_debuggable: Set(row.is_debuggable),
    };

    if existing.is_some() {
        model.update(conn).await?;
    } else {
        model.insert(conn).await?;
    }
    Ok(())
}

fn encode<T: serde::Serialize>(
    field: &'static str,
    value: &T,
) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serialization { field, source })
}

fn decode<T: serde::de::DeserializeOwned>(
    field: &'static str,
    value: serde_json::Value,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        field,
        message: e.to_string(),
    })
}

fn bookkeeping_from_model(model: background_fetch_data::Model) -> FetchBookkeeping {
    FetchBookkeeping {
        owner: model.owner,
        buyer: model.buyer,
        name: model.name,
        daily_update_uri: model.daily_update_uri,
        eligible_update_time: model.eligible_update_time.with_timezone(&Utc),
        num_validation_failures: model.num_validation_failures,
        num_timeout_failures: model.num_timeout_failures,
        is_debuggable: model.is_debuggable,
    }
}

fn audience_from_model(model: custom_audience::Model) -> Result<CustomAudience, StoreError> {
    Ok(CustomAudience {
        owner: model.owner,
        buyer: model.buyer,
        name: model.name,
        activation_time: model.activation_time.with_timezone(&Utc),
        expiration_time: model.expiration_time.with_timezone(&Utc),
        bidding_logic_uri: model.bidding_logic_uri,
        user_bidding_signals: model.user_bidding_signals,
        trusted_bidding_data: model
            .trusted_bidding_data
            .map(|v| decode::<TrustedBiddingData>("trusted_bidding_data", v))
            .transpose()?,
        ads: model
            .ads
            .map(|v| decode::<Vec<AdData>>("ads", v))
            .transpose()?,
        auction_server_request_flags: AuctionServerRequestFlags(model.auction_server_request_flags),
        priority: model.priority,
    })
}
