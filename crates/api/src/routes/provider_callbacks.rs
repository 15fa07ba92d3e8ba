//! Signed event callbacks from the provider sidecar.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use domain::services::ProviderEvent;
use domain::CoreError;
use shared::crypto::verify_signature;

use crate::app::AppState;
use crate::error::ApiError;

pub const SIGNATURE_HEADER: &str = "x-signature";

/// Accepts one provider event and hands it to the session event pump.
///
/// POST /internal/provider/events
///
/// The signature covers the raw body, so it is checked before parsing.
pub async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let secret = &state.config.provider.callback_secret;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if secret.is_empty() || !verify_signature(secret, &body, signature) {
        tracing::warn!("Rejected provider callback with bad signature");
        return Err(ApiError::Unauthorized("Invalid signature".to_string()));
    }

    let event: ProviderEvent = serde_json::from_slice(&body)
        .map_err(|e| CoreError::Validation(format!("malformed provider event: {}", e)))?;

    tracing::debug!(device_id = %event.device_id, event = event.name(), "Provider event received");

    state
        .provider_events
        .send(event)
        .await
        .map_err(|_| ApiError::Internal("provider event pump is gone".to_string()))?;

    Ok(StatusCode::ACCEPTED)
}
