//! PartialCustomAudience entity model

use super::scheduled_update::Entity as ScheduledUpdate;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Override for one named audience, owned by a scheduled update
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "partial_custom_audiences")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub update_id: Uuid,

    pub name: String,

    pub activation_time: Option<DateTimeWithTimeZone>,

    pub expiration_time: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary")]
    pub user_bidding_signals: Option<JsonValue>,
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
