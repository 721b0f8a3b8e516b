//! Migration to create the scheduled_custom_audience_updates table.
//!
//! Each row is a delayed fetch against a buyer URI, due at `scheduled_time`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ScheduledCustomAudienceUpdates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::Owner)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::Buyer)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::UpdateUri)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::CreationTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::ScheduledTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::AllowScheduleInResponse)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ScheduledCustomAudienceUpdates::IsDebuggable)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_ca_updates_scheduled_time")
                    .table(ScheduledCustomAudienceUpdates::Table)
                    .col(ScheduledCustomAudienceUpdates::ScheduledTime)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_scheduled_ca_updates_owner_buyer")
                    .table(ScheduledCustomAudienceUpdates::Table)
                    .col(ScheduledCustomAudienceUpdates::Owner)
                    .col(ScheduledCustomAudienceUpdates::Buyer)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_scheduled_ca_updates_owner_buyer")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_scheduled_ca_updates_scheduled_time")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(ScheduledCustomAudienceUpdates::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum ScheduledCustomAudienceUpdates {
    Table,
    Id,
    Owner,
    Buyer,
    UpdateUri,
    CreationTime,
    ScheduledTime,
    AllowScheduleInResponse,
    IsDebuggable,
}
