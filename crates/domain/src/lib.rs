//! Domain layer for the session gateway.
//!
//! This crate contains:
//! - Domain models (Device, Broadcast, QuotaCounter, gateway events)
//! - The core error taxonomy
//! - Repository and collaborator traits with in-memory implementations
//! - Core services: session state machine and manager, quota enforcement,
//!   broadcast scheduling and dispatch, event bus

pub mod error;
pub mod models;
pub mod services;
pub mod store;

pub use error::CoreError;
