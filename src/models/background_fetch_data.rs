//! Background fetch bookkeeping entity model
//!
//! Tracks the daily update URI of each audience, when it is next eligible for a
//! refresh and how many consecutive refreshes failed.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "custom_audience_background_fetch_data")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub owner: String,

    pub buyer: String,

    pub name: String,

    /// Buyer endpoint queried by the background fetch
    pub daily_update_uri: String,

    /// Earliest instant the next background fetch may run
    pub eligible_update_time: DateTimeWithTimeZone,

    /// Consecutive fetches rejected for malformed or oversized payloads
    pub num_validation_failures: i64,

    /// Consecutive fetches that failed on the network or timed out
    pub num_timeout_failures: i64,

    pub is_debuggable: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
