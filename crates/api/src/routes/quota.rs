//! Quota usage endpoint.

use axum::{extract::State, Json};
use domain::models::QuotaCheck;
use serde::Serialize;

use crate::app::AppState;
use crate::error::ApiError;
use crate::extractors::Caller;

#[derive(Debug, Serialize)]
pub struct QuotaUsageResponse {
    pub usage: Vec<QuotaCheck>,
}

/// Usage of every metered resource in the current period. Needs no
/// capability beyond a valid token.
///
/// GET /quota
pub async fn get_usage(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<QuotaUsageResponse>, ApiError> {
    let usage = state.services.quota.usage(caller.user_id).await?;
    Ok(Json(QuotaUsageResponse { usage }))
}
