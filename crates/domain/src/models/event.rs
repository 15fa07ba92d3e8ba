//! Gateway events published to subscribers.

use serde::Serialize;
use uuid::Uuid;

use super::broadcast::BroadcastStatus;

/// Lifecycle and progress events. Payload fields are camelCase on the
/// wire; the envelope keeps the REST casing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum GatewayEventKind {
    #[serde(rename = "device:connecting", rename_all = "camelCase")]
    DeviceConnecting { device_id: Uuid },

    #[serde(rename = "device:qr", rename_all = "camelCase")]
    DeviceQr { device_id: Uuid, payload: String },

    #[serde(rename = "device:connected", rename_all = "camelCase")]
    DeviceConnected { device_id: Uuid },

    #[serde(rename = "device:disconnected", rename_all = "camelCase")]
    DeviceDisconnected { device_id: Uuid },

    #[serde(rename = "device:error", rename_all = "camelCase")]
    DeviceError { device_id: Uuid, reason: String },

    #[serde(rename = "broadcast:started", rename_all = "camelCase")]
    BroadcastStarted { broadcast_id: Uuid, total: i64 },

    #[serde(rename = "broadcast:progress", rename_all = "camelCase")]
    BroadcastProgress {
        broadcast_id: Uuid,
        sent: i64,
        failed: i64,
        total: i64,
    },

    #[serde(rename = "broadcast:completed", rename_all = "camelCase")]
    BroadcastCompleted {
        broadcast_id: Uuid,
        sent: i64,
        failed: i64,
        status: BroadcastStatus,
    },
}

impl GatewayEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEventKind::DeviceConnecting { .. } => "device:connecting",
            GatewayEventKind::DeviceQr { .. } => "device:qr",
            GatewayEventKind::DeviceConnected { .. } => "device:connected",
            GatewayEventKind::DeviceDisconnected { .. } => "device:disconnected",
            GatewayEventKind::DeviceError { .. } => "device:error",
            GatewayEventKind::BroadcastStarted { .. } => "broadcast:started",
            GatewayEventKind::BroadcastProgress { .. } => "broadcast:progress",
            GatewayEventKind::BroadcastCompleted { .. } => "broadcast:completed",
        }
    }
}

/// An event addressed to a user and, optionally, one of their devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayEvent {
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: GatewayEventKind,
}

impl GatewayEvent {
    pub fn for_device(user_id: Uuid, device_id: Uuid, kind: GatewayEventKind) -> Self {
        Self {
            user_id,
            device_id: Some(device_id),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Whether a subscriber of `room` should receive this event.
    pub fn is_in(&self, room: &Room) -> bool {
        match room {
            Room::User(user_id) => self.user_id == *user_id,
            Room::Device(device_id) => self.device_id == Some(*device_id),
        }
    }
}

/// Subscription grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(Uuid),
    Device(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let user_id = Uuid::new_v4();
        let device_id = Uuid::new_v4();
        let event = GatewayEvent::for_device(
            user_id,
            device_id,
            GatewayEventKind::DeviceQr {
                device_id,
                payload: "2@abc".to_string(),
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "device:qr");
        assert_eq!(json["data"]["payload"], "2@abc");
        assert_eq!(json["data"]["deviceId"], device_id.to_string());
        assert!(json["data"].get("device_id").is_none());
        assert_eq!(json["user_id"], user_id.to_string());
        assert_eq!(json["device_id"], device_id.to_string());
    }

    #[test]
    fn test_name_matches_serialized_tag() {
        let kind = GatewayEventKind::BroadcastProgress {
            broadcast_id: Uuid::new_v4(),
            sent: 1,
            failed: 0,
            total: 3,
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["event"], kind.name());
        assert!(json["data"]["broadcastId"].is_string());
        assert_eq!(json["data"]["total"], 3);
    }

    #[test]
    fn test_room_membership() {
        let user_id = Uuid::new_v4();
        let device_id = Uuid::new_v4();
        let event = GatewayEvent {
            user_id,
            device_id: None,
            kind: GatewayEventKind::BroadcastStarted {
                broadcast_id: Uuid::new_v4(),
                total: 2,
            },
        };

        assert!(event.is_in(&Room::User(user_id)));
        assert!(!event.is_in(&Room::User(Uuid::new_v4())));
        assert!(!event.is_in(&Room::Device(device_id)));
    }
}
