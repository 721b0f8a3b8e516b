//! Migration to create the app_install_entries table.
//!
//! Records which buyers may filter ads on a given installed package.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AppInstallEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AppInstallEntries::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AppInstallEntries::Buyer).text().not_null())
                    .col(
                        ColumnDef::new(AppInstallEntries::PackageName)
                            .text()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_app_install_entries_buyer_package")
                    .table(AppInstallEntries::Table)
                    .col(AppInstallEntries::Buyer)
                    .col(AppInstallEntries::PackageName)
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
                    .name("idx_app_install_entries_buyer_package")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(AppInstallEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AppInstallEntries {
    Table,
    Id,
    Buyer,
    PackageName,
}
