//! Device domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Connection status of a device's provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::QrPending => "qr_pending",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Error => "error",
        }
    }

    /// Whether a plain connect request is accepted from this status.
    pub fn accepts_connect(&self) -> bool {
        matches!(self, DeviceStatus::Disconnected | DeviceStatus::Error)
    }

    /// Whether this status implies a live provider handle.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            DeviceStatus::Connecting | DeviceStatus::QrPending | DeviceStatus::Connected
        )
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(DeviceStatus::Disconnected),
            "connecting" => Ok(DeviceStatus::Connecting),
            "qr_pending" => Ok(DeviceStatus::QrPending),
            "connected" => Ok(DeviceStatus::Connected),
            "error" => Ok(DeviceStatus::Error),
            other => Err(format!("unknown device status: {}", other)),
        }
    }
}

/// A user-owned messaging-provider session slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
    #[serde(skip_serializing)]
    pub qr_payload: Option<String>,
    pub qr_issued_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// A freshly created, never connected device.
    pub fn new(user_id: Uuid, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            status: DeviceStatus::Disconnected,
            session_token: None,
            qr_payload: None,
            qr_issued_at: None,
            last_error: None,
            last_activity_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Response body for status reads.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatusResponse {
    pub device_id: Uuid,
    pub status: DeviceStatus,
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of a QR read.
#[derive(Debug, Clone, PartialEq)]
pub enum QrState {
    /// Pairing payload ready to be rendered.
    Ready {
        payload: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    /// Handshake still in progress; poll again later.
    Generating { retry_after_seconds: u64 },
}
