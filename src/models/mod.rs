//! # Data Models
//!
//! SeaORM entities for audiences, their fetch bookkeeping and scheduled updates.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod app_install_entry;
pub mod background_fetch_data;
pub mod custom_audience;
pub mod custom_audience_to_leave;
pub mod partial_custom_audience;
pub mod scheduled_update;

pub use app_install_entry::Entity as AppInstallEntry;
pub use background_fetch_data::Entity as BackgroundFetchData;
pub use custom_audience::Entity as CustomAudience;
pub use custom_audience_to_leave::Entity as CustomAudienceToLeave;
pub use partial_custom_audience::Entity as PartialCustomAudience;
pub use scheduled_update::Entity as ScheduledUpdate;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "audience-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
