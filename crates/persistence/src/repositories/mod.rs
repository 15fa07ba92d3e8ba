//! Repository implementations for database operations.
//!
//! Each repository also implements the matching store or collaborator
//! trait from the domain crate.

pub mod broadcast;
pub mod contact;
pub mod device;
pub mod plan;
pub mod quota;

pub use broadcast::BroadcastRepository;
pub use contact::ContactRepository;
pub use device::DeviceRepository;
pub use plan::PgPlanRepository;
pub use quota::QuotaRepository;
