//! Device endpoint handlers.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use domain::models::{Device, DeviceStatus, DeviceStatusResponse, QrState, SendMessageRequest};
use domain::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::extractors::Caller;
use crate::middleware::{require, Capability};

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ListDevicesResponse {
    pub devices: Vec<Device>,
    pub total: usize,
}

/// Body of connect, reconnect and disconnect responses.
#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub device_id: Uuid,
    pub status: DeviceStatus,
}

#[derive(Debug, Serialize)]
pub struct QrResponse {
    pub qr_payload: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: String,
}

/// Register a device.
///
/// POST /devices
pub async fn register_device(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    require(&caller, Capability::DevicesManage)?;
    let device = state
        .services
        .devices
        .register(caller.user_id, &request.name)
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

/// GET /devices
pub async fn list_devices(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ListDevicesResponse>, ApiError> {
    require(&caller, Capability::DevicesRead)?;
    let devices = state.services.devices.list(caller.user_id).await?;
    let total = devices.len();
    Ok(Json(ListDevicesResponse { devices, total }))
}

/// Delete a device, ending its session first.
///
/// DELETE /devices/:device_id
pub async fn delete_device(
    State(state): State<AppState>,
    caller: Caller,
    Path(device_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require(&caller, Capability::DevicesManage)?;
    state
        .services
        .devices
        .delete(caller.user_id, device_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start pairing. Only accepted from `disconnected` or `error`.
///
/// POST /devices/:device_id/connect
pub async fn connect_device(
    State(state): State<AppState>,
    caller: Caller,
    Path(device_id): Path<Uuid>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    require(&caller, Capability::DevicesManage)?;
    let status = state
        .services
        .sessions
        .connect(caller.user_id, device_id)
        .await?;
    Ok(Json(ConnectionResponse { device_id, status }))
}

/// Drop whatever session exists and start pairing again.
///
/// POST /devices/:device_id/reconnect
pub async fn reconnect_device(
    State(state): State<AppState>,
    caller: Caller,
    Path(device_id): Path<Uuid>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    require(&caller, Capability::DevicesManage)?;
    let status = state
        .services
        .sessions
        .reconnect(caller.user_id, device_id)
        .await?;
    Ok(Json(ConnectionResponse { device_id, status }))
}

/// POST /devices/:device_id/disconnect
pub async fn disconnect_device(
    State(state): State<AppState>,
    caller: Caller,
    Path(device_id): Path<Uuid>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    require(&caller, Capability::DevicesManage)?;
    let status = state
        .services
        .sessions
        .disconnect(caller.user_id, device_id)
        .await?;
    Ok(Json(ConnectionResponse { device_id, status }))
}

/// Current pairing QR.
///
/// GET /devices/:device_id/qr
///
/// 200 with the payload, 202 with a retry hint while the handshake is still
/// producing one, 400 with a reason when the device is in no state to pair.
pub async fn get_qr(
    State(state): State<AppState>,
    caller: Caller,
    Path(device_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require(&caller, Capability::DevicesRead)?;

    match state.services.sessions.get_qr(caller.user_id, device_id).await {
        Ok(QrState::Ready {
            payload,
            expires_at,
            ..
        }) => Ok(Json(QrResponse {
            qr_payload: payload,
            expires_at,
        })
        .into_response()),
        Ok(QrState::Generating {
            retry_after_seconds,
        }) => Ok((
            StatusCode::ACCEPTED,
            [(header::RETRY_AFTER, retry_after_seconds.to_string())],
            Json(json!({ "retry_after_seconds": retry_after_seconds })),
        )
            .into_response()),
        Err(CoreError::InvalidState(reason)) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_state", "reason": reason })),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

/// GET /devices/:device_id/status
pub async fn get_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(device_id): Path<Uuid>,
) -> Result<Json<DeviceStatusResponse>, ApiError> {
    require(&caller, Capability::DevicesRead)?;
    let status = state
        .services
        .sessions
        .get_status(caller.user_id, device_id)
        .await?;
    Ok(Json(status))
}

/// Send one message outside any broadcast.
///
/// POST /devices/:device_id/messages
pub async fn send_message(
    State(state): State<AppState>,
    caller: Caller,
    Path(device_id): Path<Uuid>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    require(&caller, Capability::MessagesSend)?;
    let receipt = state
        .services
        .messages
        .send(caller.user_id, device_id, request)
        .await?;
    Ok(Json(SendMessageResponse {
        message_id: receipt.message_id,
    }))
}
