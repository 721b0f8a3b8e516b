//! Migration to create the custom_audience_background_fetch_data table.
//!
//! Tracks where each audience is refreshed from and when it is next eligible.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CustomAudienceBackgroundFetchData::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::Owner)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::Buyer)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::Name)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::DailyUpdateUri)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::EligibleUpdateTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::NumValidationFailures)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::NumTimeoutFailures)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CustomAudienceBackgroundFetchData::IsDebuggable)
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
                    .name("idx_ca_fetch_data_owner_buyer_name")
                    .table(CustomAudienceBackgroundFetchData::Table)
                    .col(CustomAudienceBackgroundFetchData::Owner)
                    .col(CustomAudienceBackgroundFetchData::Buyer)
                    .col(CustomAudienceBackgroundFetchData::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_ca_fetch_data_eligible_update_time")
                    .table(CustomAudienceBackgroundFetchData::Table)
                    .col(CustomAudienceBackgroundFetchData::EligibleUpdateTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_ca_fetch_data_eligible_update_time")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_ca_fetch_data_owner_buyer_name")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(CustomAudienceBackgroundFetchData::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum CustomAudienceBackgroundFetchData {
    Table,
    Id,
    Owner,
    Buyer,
    Name,
    DailyUpdateUri,
    EligibleUpdateTime,
    NumValidationFailures,
    NumTimeoutFailures,
    IsDebuggable,
}
