//! Broadcast endpoint handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use domain::models::{Broadcast, CreateBroadcastRequest, RecipientOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::extractors::Caller;
use crate::middleware::{require, Capability};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListBroadcastsQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListBroadcastsQuery {
    fn page(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Serialize)]
pub struct ListBroadcastsResponse {
    pub broadcasts: Vec<Broadcast>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct RecipientOutcomesResponse {
    pub broadcast_id: Uuid,
    pub recipients: Vec<RecipientOutcome>,
}

/// Create a broadcast, immediate or scheduled.
///
/// POST /broadcasts
pub async fn create_broadcast(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateBroadcastRequest>,
) -> Result<(StatusCode, Json<Broadcast>), ApiError> {
    require(&caller, Capability::BroadcastsWrite)?;
    let broadcast = state
        .services
        .broadcasts
        .create(caller.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(broadcast)))
}

/// The caller's broadcasts, newest first.
///
/// GET /broadcasts?limit=&offset=
pub async fn list_broadcasts(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<ListBroadcastsQuery>,
) -> Result<Json<ListBroadcastsResponse>, ApiError> {
    require(&caller, Capability::BroadcastsRead)?;
    let (limit, offset) = query.page();
    let broadcasts = state
        .services
        .broadcasts
        .list(caller.user_id, limit, offset)
        .await?;
    Ok(Json(ListBroadcastsResponse {
        broadcasts,
        limit,
        offset,
    }))
}

/// GET /broadcasts/:broadcast_id
pub async fn get_broadcast(
    State(state): State<AppState>,
    caller: Caller,
    Path(broadcast_id): Path<Uuid>,
) -> Result<Json<Broadcast>, ApiError> {
    require(&caller, Capability::BroadcastsRead)?;
    let broadcast = state
        .services
        .broadcasts
        .get(caller.user_id, broadcast_id)
        .await?;
    Ok(Json(broadcast))
}

/// Cancel a broadcast that has not started. A running or finished one
/// answers 400 `too_late`.
///
/// DELETE /broadcasts/:broadcast_id/cancel
pub async fn cancel_broadcast(
    State(state): State<AppState>,
    caller: Caller,
    Path(broadcast_id): Path<Uuid>,
) -> Result<Json<Broadcast>, ApiError> {
    require(&caller, Capability::BroadcastsWrite)?;
    let broadcast = state
        .services
        .broadcasts
        .cancel(caller.user_id, broadcast_id)
        .await?;
    Ok(Json(broadcast))
}

/// GET /broadcasts/:broadcast_id/recipients
pub async fn list_recipients(
    State(state): State<AppState>,
    caller: Caller,
    Path(broadcast_id): Path<Uuid>,
) -> Result<Json<RecipientOutcomesResponse>, ApiError> {
    require(&caller, Capability::BroadcastsRead)?;
    let recipients = state
        .services
        .broadcasts
        .outcomes(caller.user_id, broadcast_id)
        .await?;
    Ok(Json(RecipientOutcomesResponse {
        broadcast_id,
        recipients,
    }))
}
