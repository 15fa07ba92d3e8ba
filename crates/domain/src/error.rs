//! Core error taxonomy.

use thiserror::Error;

use crate::models::quota::{QuotaLimit, ResourceKind};
use crate::store::StoreError;

/// Errors surfaced by the core services.
///
/// Every variant except `Storage` and `Upstream` is a caller error and is
/// never retried automatically.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Caller does not own {0}")]
    Ownership(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Quota exceeded for {resource}: {current}/{limit}")]
    QuotaExceeded {
        resource: ResourceKind,
        current: i64,
        limit: QuotaLimit,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Recipient set resolved to no recipients")]
    EmptyRecipients,

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Too late: {0}")]
    TooLate(String),

    #[error("Device is not connected")]
    NotConnected,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl CoreError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Ownership(_) => "ownership_error",
            CoreError::Conflict(_) => "conflict",
            CoreError::InvalidState(_) => "invalid_state",
            CoreError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            CoreError::Upstream(_) => "upstream_error",
            CoreError::EmptyRecipients => "empty_recipients",
            CoreError::InvalidSchedule(_) => "invalid_schedule",
            CoreError::TooLate(_) => "too_late",
            CoreError::NotConnected => "not_connected",
            CoreError::Storage(_) => "internal_error",
        }
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(m) => format!("{}: {}", field, m),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();

        if messages.is_empty() {
            CoreError::Validation("invalid request".to_string())
        } else {
            CoreError::Validation(messages.join("; "))
        }
    }
}
