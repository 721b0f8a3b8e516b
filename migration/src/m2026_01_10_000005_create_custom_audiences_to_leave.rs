//! Migration to create the custom_audiences_to_leave table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CustomAudiencesToLeave::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CustomAudiencesToLeave::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CustomAudiencesToLeave::UpdateId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CustomAudiencesToLeave::Name).text().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_custom_audiences_to_leave_update_id")
                            .from(CustomAudiencesToLeave::Table, CustomAudiencesToLeave::UpdateId)
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
                    .name("idx_custom_audiences_to_leave_update_id")
                    .table(CustomAudiencesToLeave::Table)
                    .col(CustomAudiencesToLeave::UpdateId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_custom_audiences_to_leave_update_id")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(CustomAudiencesToLeave::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CustomAudiencesToLeave {
    Table,
    Id,
    UpdateId,
    Name,
}

#[derive(DeriveIden)]
enum ScheduledCustomAudienceUpdates {
    Table,
    Id,
}
