//! WebSocket event stream.
//!
//! Browsers cannot set headers on a WebSocket handshake, so the token
//! travels as a query parameter and is verified here instead of by the
//! auth middleware.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use domain::models::Room;
use domain::services::RoomSubscription;
use futures_util::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::{require, Capability, UserAuth};

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub token: Option<String>,
    /// Narrows the stream to one of the caller's devices.
    pub device_id: Option<Uuid>,
}

/// GET /events?token=...&device_id=...
///
/// The caller is checked before the upgrade itself, so a bad token answers
/// 401 even on a plain HTTP request.
pub async fn subscribe(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Missing token".to_string()))?;
    let auth = UserAuth::validate(&state.verifier, token)?;
    require(&auth, Capability::EventsSubscribe)?;

    let mut rooms = vec![Room::User(auth.user_id)];
    if let Some(device_id) = query.device_id {
        state
            .services
            .sessions
            .authorize(auth.user_id, device_id)
            .await?;
        rooms.push(Room::Device(device_id));
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let subscription = RoomSubscription::new(&state.services.events, rooms);
    let user_id = auth.user_id;
    Ok(ws
        .on_upgrade(move |socket| stream_events(socket, subscription, user_id))
        .into_response())
}

async fn stream_events(mut socket: WebSocket, mut subscription: RoomSubscription, user_id: Uuid) {
    tracing::debug!(user_id = %user_id, "Event stream opened");

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&*event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize event");
                        continue;
                    }
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text.trim() == "ping" => {
                        if socket.send(Message::Text("pong".to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!(user_id = %user_id, "Event stream closed");
}
