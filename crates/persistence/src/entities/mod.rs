//! Database entity definitions.
//!
//! Entities are direct mappings to database rows.

pub mod broadcast;
pub mod device;
pub mod plan;

pub use broadcast::{BroadcastEntity, BroadcastRecipientEntity};
pub use device::DeviceEntity;
pub use plan::PlanLimitsEntity;
