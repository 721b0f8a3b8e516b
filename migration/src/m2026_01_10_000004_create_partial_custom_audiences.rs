//! Migration to create the partial_custom_audiences table.
//!
//! Caller-supplied overrides attached to a scheduled update.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PartialCustomAudiences::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PartialCustomAudiences::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PartialCustomAudiences::UpdateId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(PartialCustomAudiences::Name).text().not_null())
                    .col(
                        ColumnDef::new(PartialCustomAudiences::ActivationTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PartialCustomAudiences::ExpirationTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PartialCustomAudiences::UserBiddingSignals)
                            .json_binary()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_partial_custom_audiences_update_id")
                            .from(PartialCustomAudiences::Table, PartialCustomAudiences::UpdateId)
                            .to(
                                ScheduledCustomAudienceUpdates::Table,
                                ScheduledCustomAudienceUpdates::Id,
                            )
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_partial_custom_audiences_update_name")
                    .table(PartialCustomAudiences::Table)
                    .col(PartialCustomAudiences::UpdateId)
                    .col(PartialCustomAudiences::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_partial_custom_audiences_update_name")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(PartialCustomAudiences::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PartialCustomAudiences {
    Table,
    Id,
    UpdateId,
    Name,
    ActivationTime,
    ExpirationTime,
    UserBiddingSignals,
}

#[derive(DeriveIden)]
enum ScheduledCustomAudienceUpdates {
    Table,
    Id,
}
