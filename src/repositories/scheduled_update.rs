//! Scheduled update repository for database operations
//!
//! Persists delayed updates together with their partial audiences and leave
//! names. The three tables are always written and removed in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::audience::PartialCustomAudience;
use crate::error::{StoreError, is_unique_violation};
use crate::models::{custom_audience_to_leave, partial_custom_audience, scheduled_update};
use crate::store::{ScheduledUpdate, ScheduledUpdateStore};

/// Repository for scheduled update database operations
#[derive(Debug, Clone)]
pub struct ScheduledUpdateRepository {
    db: DatabaseConnection,
}

impl ScheduledUpdateRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Number of pending updates for an owner and buyer.
    pub async fn count_pending_for(&self, owner: &str, buyer: &str) -> Result<u64, StoreError> {
        Ok(scheduled_update::Entity::find()
            .filter(scheduled_update::Column::Owner.eq(owner))
            .filter(scheduled_update::Column::Buyer.eq(buyer))
            .count(&self.db)
            .await?)
    }

    async fn delete_with_children<C: ConnectionTrait>(
        conn: &C,
        ids: Vec<Uuid>,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        partial_custom_audience::Entity::delete_many()
            .filter(partial_custom_audience::Column::UpdateId.is_in(ids.clone()))
            .exec(conn)
            .await?;
        custom_audience_to_leave::Entity::delete_many()
            .filter(custom_audience_to_leave::Column::UpdateId.is_in(ids.clone()))
            .exec(conn)
            .await?;
        Ok(scheduled_update::Entity::delete_many()
            .filter(scheduled_update::Column::Id.is_in(ids))
            .exec(conn)
            .await?
            .rows_affected)
    }
}

#[async_trait]
impl ScheduledUpdateStore for ScheduledUpdateRepository {
    async fn get_due_scheduled_updates(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<ScheduledUpdate>, StoreError> {
        let rows = scheduled_update::Entity::find()
            .filter(scheduled_update::Column::ScheduledTime.lte(before.fixed_offset()))
            .order_by_asc(scheduled_update::Column::ScheduledTime)
            .all(&self.db)
            .await
            .map_err(|e| {
                tracing::error!("Failed to load due scheduled updates: {}", e);
                StoreError::from(e)
            })?;

        Ok(rows.into_iter().map(update_from_model).collect())
    }

    async fn get_overrides_for(
        &self,
        update_id: Uuid,
    ) -> Result<Vec<PartialCustomAudience>, StoreError> {
        let rows = partial_custom_audience::Entity::find()
            .filter(partial_custom_audience::Column::UpdateId.eq(update_id))
            .order_by_asc(partial_custom_audience::Column::Name)
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| PartialCustomAudience {
                name: row.name,
                activation_time: row.activation_time.map(|t| t.with_timezone(&Utc)),
                expiration_time: row.expiration_time.map(|t| t.with_timezone(&Utc)),
                user_bidding_signals: row.user_bidding_signals,
            })
            .collect())
    }

    async fn get_leave_names_for(&self, update_id: Uuid) -> Result<Vec<String>, StoreError> {
        let rows = custom_audience_to_leave::Entity::find()
            .filter(custom_audience_to_leave::Column::UpdateId.eq(update_id))
            .order_by_asc(custom_audience_to_leave::Column::Name)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }

    async fn insert_scheduled_update(
        &self,
        update: &ScheduledUpdate,
        overrides: &[PartialCustomAudience],
        leave_names: &[String],
        replace_pending: bool,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;

        let pending: Vec<Uuid> = scheduled_update::Entity::find()
            .filter(scheduled_update::Column::Owner.eq(update.owner.as_str()))
            .filter(scheduled_update::Column::Buyer.eq(update.buyer.as_str()))
            .all(&txn)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();

        if !pending.is_empty() {
            if !replace_pending {
                return Err(StoreError::PendingUpdateExists {
                    owner: update.owner.clone(),
                    buyer: update.buyer.clone(),
                });
            }
            let removed = Self::delete_with_children(&txn, pending).await?;
            tracing::debug!(
                owner = %update.owner,
                buyer = %update.buyer,
                removed,
                "Replaced pending scheduled updates"
            );
        }

        scheduled_update::ActiveModel {
            id: Set(update.id),
            owner: Set(update.owner.clone()),
            buyer: Set(update.buyer.clone()),
            update_uri: Set(update.update_uri.clone()),
            creation_time: Set(update.creation_time.fixed_offset()),
            scheduled_time: Set(update.scheduled_time.fixed_offset()),
            allow_schedule_in_response: Set(update.allow_schedule_in_response),
            is_debuggable: Set(update.is_debuggable),
        }
        .insert(&txn)
        .await?;

        for partial in overrides {
            partial_custom_audience::ActiveModel {
                id: Set(Uuid::new_v4()),
                update_id: Set(update.id),
                name: Set(partial.name.clone()),
                activation_time: Set(partial.activation_time.map(|t| t.fixed_offset())),
                expiration_time: Set(partial.expiration_time.map(|t| t.fixed_offset())),
                user_bidding_signals: Set(partial.user_bidding_signals.clone()),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Corrupt {
                        field: "partial_custom_audience_data",
                        message: format!("duplicate override for '{}'", partial.name),
                    }
                } else {
                    StoreError::from(e)
                }
            })?;
        }

        for name in leave_names {
            custom_audience_to_leave::ActiveModel {
                id: Set(Uuid::new_v4()),
                update_id: Set(update.id),
                name: Set(name.clone()),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn delete_scheduled_update(&self, update_id: Uuid) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;
        Self::delete_with_children(&txn, vec![update_id]).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn delete_updates_created_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = scheduled_update::Entity::find()
            .filter(scheduled_update::Column::CreationTime.lt(before.fixed_offset()))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();

        let txn = self.db.begin().await?;
        let removed = Self::delete_with_children(&txn, ids).await?;
        txn.commit().await?;
        Ok(removed)
    }
}

fn update_from_model(model: scheduled_update::Model) -> ScheduledUpdate {
    ScheduledUpdate {
        id: model.id,
        owner: model.owner,
        buyer: model.buyer,
        update_uri: model.update_uri,
        creation_time: model.creation_time.with_timezone(&Utc),
        scheduled_time: model.scheduled_time.with_timezone(&Utc),
        allow_schedule_in_response: model.allow_schedule_in_response,
        is_debuggable: model.is_debuggable,
    }
}
