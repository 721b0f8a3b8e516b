//! ScheduledUpdate entity model
//!
//! A pending delayed fetch against a buyer URI. Partial audiences and leave
//! requests hang off it and are removed with it.

use super::custom_audience_to_leave::Entity as CustomAudienceToLeave;
use super::partial_custom_audience::Entity as PartialCustomAudience;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "scheduled_custom_audience_updates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Application that scheduled the update
    pub owner: String,

    pub buyer: String,

    /// Endpoint receiving the POST once the update is due
    pub update_uri: String,

    pub creation_time: DateTimeWithTimeZone,

    /// Due time; the update runs on the first job after this instant
    pub scheduled_time: DateTimeWithTimeZone,

    /// Whether the response may schedule further updates
    pub allow_schedule_in_response: bool,

    pub is_debuggable: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "PartialCustomAudience")]
    PartialCustomAudience,
    #[sea_orm(has_many = "CustomAudienceToLeave")]
    CustomAudienceToLeave,
}

impl Related<PartialCustomAudience> for Entity {
    fn to() -> RelationDef {
        Relation::PartialCustomAudience.def()
    }
}

impl Related<CustomAudienceToLeave> for Entity {
    fn to() -> RelationDef {
        Relation::CustomAudienceToLeave.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
