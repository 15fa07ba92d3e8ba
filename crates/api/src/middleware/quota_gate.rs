//! Consumes one `api_requests` unit per gated call.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use domain::models::ResourceKind;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::user_auth::UserAuth;

/// Must run after [`super::require_user_auth`]. A denied request never
/// reaches the handler.
pub async fn quota_gate(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let Some(user_id) = req.extensions().get::<UserAuth>().map(|a| a.user_id) else {
        return ApiError::Unauthorized("Missing authentication".to_string()).into_response();
    };

    if let Err(err) = state
        .services
        .quota
        .consume(user_id, ResourceKind::ApiRequests)
        .await
    {
        return ApiError::from(err).into_response();
    }

    next.run(req).await
}
