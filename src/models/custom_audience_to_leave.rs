//! CustomAudienceToLeave entity model

use super::scheduled_update::Entity as ScheduledUpdate;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

/// Audience name removed when its scheduled update runs
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "custom_audiences_to_leave")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub update_id: Uuid,

    pub name: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "ScheduledUpdate",
        from = "Column::UpdateId",
        to = "super::scheduled_update::Column::Id",
        on_delete = "Cascade"
    )]
    ScheduledUpdate,
}

impl Related<ScheduledUpdate> for Entity {
    fn to() -> RelationDef {
        Relation::ScheduledUpdate.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
