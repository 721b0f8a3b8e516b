//! Migration to create the custom_audiences table.
//!
//! One row per (owner, buyer, name); ads, signals and trusted bidding data are
//! stored as JSON documents.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CustomAudiences::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CustomAudiences::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CustomAudiences::Owner).text().not_null())
                    .col(ColumnDef::new(CustomAudiences::Buyer).text().not_null())
                    .col(ColumnDef::new(CustomAudiences::Name).text().not_null())
                    .col(
                        ColumnDef::new(CustomAudiences::ActivationTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::ExpirationTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::BiddingLogicUri)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::UserBiddingSignals)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::TrustedBiddingData)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(CustomAudiences::Ads).json_binary().null())
                    .col(
                        ColumnDef::new(CustomAudiences::AuctionServerRequestFlags)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::Priority)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::IsDebuggable)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::CreationTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CustomAudiences::LastUpdated)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_custom_audiences_owner_buyer_name")
                    .table(CustomAudiences::Table)
                    .col(CustomAudiences::Owner)
                    .col(CustomAudiences::Buyer)
                    .col(CustomAudiences::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_custom_audiences_expiration_time")
                    .table(CustomAudiences::Table)
                    .col(CustomAudiences::ExpirationTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_custom_audiences_expiration_time")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_custom_audiences_owner_buyer_name")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(CustomAudiences::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CustomAudiences {
    Table,
    Id,
    Owner,
    Buyer,
    Name,
    ActivationTime,
    ExpirationTime,
    BiddingLogicUri,
    UserBiddingSignals,
    TrustedBiddingData,
    Ads,
    AuctionServerRequestFlags,
    Priority,
    IsDebuggable,
    CreationTime,
    LastUpdated,
}
