//! HTTP route handlers.

pub mod broadcasts;
pub mod devices;
pub mod events;
pub mod health;
pub mod provider_callbacks;
pub mod quota;
