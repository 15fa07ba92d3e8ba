use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::models::{QuotaLimit, ResourceKind};
use domain::CoreError;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    /// Anything the core reports.
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Core(err) => core_status(err),
        }
    }
}

fn core_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_)
        | CoreError::EmptyRecipients
        | CoreError::InvalidSchedule(_)
        | CoreError::InvalidState(_)
        | CoreError::TooLate(_)
        | CoreError::NotConnected => StatusCode::BAD_REQUEST,
        CoreError::Ownership(_) => StatusCode::FORBIDDEN,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Upstream(_) => StatusCode::BAD_GATEWAY,
        CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Body of every quota denial.
pub fn quota_exceeded_response(resource: ResourceKind, current: i64, limit: QuotaLimit) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "QUOTA_EXCEEDED",
            "resource": resource,
            "current": current,
            "limit": limit,
        })),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_code, message) = match self {
            ApiError::Unauthorized(msg) => ("unauthorized", msg),
            ApiError::Forbidden(msg) => ("forbidden", msg),
            ApiError::RateLimited { retry_after_secs } => {
                let mut response = (
                    status,
                    Json(json!({
                        "error": "rate_limited",
                        "message": "Too many requests. Please try again later.",
                        "retry_after_seconds": retry_after_secs,
                    })),
                )
                    .into_response();
                if let Ok(value) = retry_after_secs.to_string().parse() {
                    response
                        .headers_mut()
                        .insert(axum::http::header::RETRY_AFTER, value);
                }
                return response;
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("internal_error", "An internal error occurred".to_string())
            }
            ApiError::Core(CoreError::QuotaExceeded {
                resource,
                current,
                limit,
            }) => return quota_exceeded_response(resource, current, limit),
            ApiError::Core(CoreError::Storage(err)) => {
                tracing::error!(error = %err, "Storage failure");
                ("internal_error", "An internal error occurred".to_string())
            }
            ApiError::Core(err) => {
                if matches!(err, CoreError::Upstream(_)) {
                    tracing::warn!(error = %err, "Upstream failure surfaced to caller");
                }
                (err.code(), err.to_string())
            }
        };

        let body = ErrorBody {
            error: error_code.into(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::Core(CoreError::from(errors))
    }
}
