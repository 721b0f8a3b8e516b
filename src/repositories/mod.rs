//! # Repository Layer
//!
//! SeaORM implementations of the store traits in [`crate::store`].

pub mod custom_audience;
pub mod scheduled_update;

pub use custom_audience::{CustomAudienceRepository, QuantityLimits};
pub use scheduled_update::ScheduledUpdateRepository;
