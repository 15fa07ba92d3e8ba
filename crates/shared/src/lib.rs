//! Shared utilities and common types for the session gateway.
//!
//! This crate provides common functionality used across all other crates:
//! - Bearer token verification (RS256 JWT)
//! - HMAC signatures for provider callbacks
//! - Recipient and schedule validation

pub mod crypto;
pub mod jwt;
pub mod validation;
