//! Device connection state machine.
//!
//! Pure transition logic over plain data. The session manager owns the
//! side effects: persistence, timers, provider calls and event publishing.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{Device, DeviceStatus, GatewayEventKind};
use crate::store::DeviceSessionRecord;

pub const QR_EXPIRED_REASON: &str = "QR code expired before pairing";
pub const PAIRING_TIMEOUT_REASON: &str = "Pairing handshake timed out";

/// Inputs that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Connect,
    Reconnect,
    QrIssued { payload: String },
    Paired { session_token: String },
    PairingFailed { reason: String },
    QrExpired,
    PairingTimedOut,
    SessionDropped { reason: Option<String> },
    SessionInvalidated { reason: String },
    Disconnect,
    MessageSent,
}

impl SessionInput {
    pub fn name(&self) -> &'static str {
        match self {
            SessionInput::Connect => "connect",
            SessionInput::Reconnect => "reconnect",
            SessionInput::QrIssued { .. } => "qr_issued",
            SessionInput::Paired { .. } => "paired",
            SessionInput::PairingFailed { .. } => "pairing_failed",
            SessionInput::QrExpired => "qr_expired",
            SessionInput::PairingTimedOut => "pairing_timed_out",
            SessionInput::SessionDropped { .. } => "session_dropped",
            SessionInput::SessionInvalidated { .. } => "session_invalidated",
            SessionInput::Disconnect => "disconnect",
            SessionInput::MessageSent => "message_sent",
        }
    }
}

/// Connection state of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: DeviceStatus,
    pub session_token: Option<String>,
    pub qr_payload: Option<String>,
    pub qr_issued_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: DeviceStatus::Disconnected,
            session_token: None,
            qr_payload: None,
            qr_issued_at: None,
            last_error: None,
            last_activity_at: None,
        }
    }
}

impl From<&Device> for SessionState {
    fn from(device: &Device) -> Self {
        Self {
            status: device.status,
            session_token: device.session_token.clone(),
            qr_payload: device.qr_payload.clone(),
            qr_issued_at: device.qr_issued_at,
            last_error: device.last_error.clone(),
            last_activity_at: device.last_activity_at,
        }
    }
}

impl SessionState {
    pub fn to_record(&self, device_id: Uuid) -> DeviceSessionRecord {
        DeviceSessionRecord {
            device_id,
            status: self.status,
            session_token: self.session_token.clone(),
            qr_payload: self.qr_payload.clone(),
            qr_issued_at: self.qr_issued_at,
            last_error: self.last_error.clone(),
            last_activity_at: self.last_activity_at,
        }
    }

    /// When the current QR stops being scannable.
    pub fn qr_expires_at(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        match self.status {
            DeviceStatus::QrPending => self.qr_issued_at.map(|at| at + ttl),
            _ => None,
        }
    }

    pub fn qr_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.qr_expires_at(ttl).map(|at| now >= at).unwrap_or(false)
    }

    /// Applies `input`, mutating `self` and returning the events to publish.
    ///
    /// On error `self` is left untouched.
    pub fn apply(
        &mut self,
        device_id: Uuid,
        input: SessionInput,
        now: DateTime<Utc>,
    ) -> Result<Vec<GatewayEventKind>, CoreError> {
        use DeviceStatus::*;

        let events = match (self.status, input) {
            (status, SessionInput::Connect) => {
                if !status.accepts_connect() {
                    return Err(CoreError::Conflict(format!(
                        "device {} is {}",
                        device_id, status
                    )));
                }
                self.begin_connecting();
                vec![GatewayEventKind::DeviceConnecting { device_id }]
            }

            (_, SessionInput::Reconnect) => {
                self.begin_connecting();
                vec![GatewayEventKind::DeviceConnecting { device_id }]
            }

            (Connecting | QrPending, SessionInput::QrIssued { payload }) => {
                self.status = QrPending;
                self.qr_payload = Some(payload.clone());
                self.qr_issued_at = Some(now);
                vec![GatewayEventKind::DeviceQr { device_id, payload }]
            }

            (Connecting | QrPending, SessionInput::Paired { session_token }) => {
                self.status = Connected;
                self.session_token = Some(session_token);
                self.clear_qr();
                self.last_error = None;
                self.last_activity_at = Some(now);
                vec![GatewayEventKind::DeviceConnected { device_id }]
            }

            (Connecting | QrPending, SessionInput::PairingFailed { reason }) => {
                self.fail(device_id, reason)
            }

            (QrPending, SessionInput::QrExpired) => {
                self.fail(device_id, QR_EXPIRED_REASON.to_string())
            }

            (Connecting, SessionInput::PairingTimedOut) => {
                self.fail(device_id, PAIRING_TIMEOUT_REASON.to_string())
            }

            (Connected, SessionInput::SessionDropped { reason }) => {
                self.status = Disconnected;
                self.session_token = None;
                self.last_error = reason;
                vec![GatewayEventKind::DeviceDisconnected { device_id }]
            }

            (Connecting | QrPending, SessionInput::SessionDropped { reason }) => self.fail(
                device_id,
                reason.unwrap_or_else(|| "Session dropped during pairing".to_string()),
            ),

            (Connecting | QrPending | Connected, SessionInput::SessionInvalidated { reason }) => {
                self.fail(device_id, reason)
            }

            (status, SessionInput::Disconnect) if status != Disconnected => {
                self.status = Disconnected;
                self.session_token = None;
                self.clear_qr();
                vec![GatewayEventKind::DeviceDisconnected { device_id }]
            }

            (Connected, SessionInput::MessageSent) => {
                self.last_activity_at = Some(now);
                Vec::new()
            }

            (status, input) => {
                return Err(CoreError::InvalidState(format!(
                    "cannot apply {} to device {} in state {}",
                    input.name(),
                    device_id,
                    status
                )))
            }
        };

        Ok(events)
    }

    fn begin_connecting(&mut self) {
        self.status = DeviceStatus::Connecting;
        self.session_token = None;
        self.last_error = None;
        self.clear_qr();
    }

    fn fail(&mut self, device_id: Uuid, reason: String) -> Vec<GatewayEventKind> {
        self.status = DeviceStatus::Error;
        self.session_token = None;
        self.clear_qr();
        self.last_error = Some(reason.clone());
        vec![GatewayEventKind::DeviceError { device_id, reason }]
    }

    fn clear_qr(&mut self) {
        self.qr_payload = None;
        self.qr_issued_at = None;
    }
}
