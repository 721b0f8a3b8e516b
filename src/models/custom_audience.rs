//! CustomAudience entity model
//!
//! One row per (owner, buyer, name) in the custom_audiences table.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "custom_audiences")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Application that owns the audience
    pub owner: String,

    /// Ad tech buyer the audience belongs to
    pub buyer: String,

    pub name: String,

    pub activation_time: DateTimeWithTimeZone,

    /// Audiences past this instant are garbage-collected
    pub expiration_time: DateTimeWithTimeZone,

    pub bidding_logic_uri: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub user_bidding_signals: Option<JsonValue>,

    /// Serialized trusted bidding data (`trusted_bidding_uri`, `trusted_bidding_keys`)
    #[sea_orm(column_type = "JsonBinary")]
    pub trusted_bidding_data: Option<JsonValue>,

    /// Serialized ad list
    #[sea_orm(column_type = "JsonBinary")]
    pub ads: Option<JsonValue>,

    pub auction_server_request_flags: i32,

    #[sea_orm(column_type = "Double")]
    pub priority: f64,

    /// Fetches for this audience use developer-mode semantics
    pub is_debuggable: bool,

    pub creation_time: DateTimeWithTimeZone,

    pub last_updated: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
