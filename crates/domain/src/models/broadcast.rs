//! Broadcast domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use shared::validation::{validate_media_url, validate_recipient};

/// Largest explicit recipient list accepted in one request.
pub const MAX_EXPLICIT_RECIPIENTS: usize = 10_000;

/// Broadcast lifecycle status.
///
/// `draft → scheduled → running → {completed | failed}`, with
/// `scheduled → cancelled` as the only exit before `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastStatus::Draft => "draft",
            BroadcastStatus::Scheduled => "scheduled",
            BroadcastStatus::Running => "running",
            BroadcastStatus::Completed => "completed",
            BroadcastStatus::Failed => "failed",
            BroadcastStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BroadcastStatus::Completed | BroadcastStatus::Failed | BroadcastStatus::Cancelled
        )
    }

    /// Whether the state diagram has an edge `self → next`.
    pub fn can_transition_to(&self, next: BroadcastStatus) -> bool {
        use BroadcastStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Running)
                | (Draft, Failed)
                | (Scheduled, Running)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BroadcastStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(BroadcastStatus::Draft),
            "scheduled" => Ok(BroadcastStatus::Scheduled),
            "running" => Ok(BroadcastStatus::Running),
            "completed" => Ok(BroadcastStatus::Completed),
            "failed" => Ok(BroadcastStatus::Failed),
            "cancelled" => Ok(BroadcastStatus::Cancelled),
            other => Err(format!("unknown broadcast status: {}", other)),
        }
    }
}

/// Who a broadcast goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipientSpec {
    /// Explicit addresses.
    List { recipients: Vec<String> },
    /// Contacts of the owner matching the tag filter.
    Filter {
        #[serde(default)]
        tags: Vec<String>,
        /// Require every tag instead of any.
        #[serde(default)]
        match_all: bool,
    },
}

impl RecipientSpec {
    pub fn validate_shape(&self) -> Result<(), ValidationError> {
        match self {
            RecipientSpec::List { recipients } => {
                if recipients.is_empty() {
                    return Err(shape_error("recipients", "Recipient list is empty"));
                }
                if recipients.len() > MAX_EXPLICIT_RECIPIENTS {
                    return Err(shape_error("recipients", "Recipient list is too long"));
                }
                recipients.iter().try_for_each(|r| validate_recipient(r))
            }
            RecipientSpec::Filter { tags, .. } => {
                if tags.iter().any(|t| t.trim().is_empty()) {
                    return Err(shape_error("tags", "Filter tags must not be blank"));
                }
                Ok(())
            }
        }
    }
}

fn shape_error(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

/// Content type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Document,
    Video,
    Audio,
}

/// Message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_payload_shape"))]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub kind: MessageKind,

    #[serde(default)]
    #[validate(length(max = 4096, message = "Message text must be at most 4096 characters"))]
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_media_url"))]
    pub media_url: Option<String>,
}

impl MessagePayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            text: body.into(),
            media_url: None,
        }
    }
}

fn validate_payload_shape(payload: &MessagePayload) -> Result<(), ValidationError> {
    match payload.kind {
        MessageKind::Text if payload.text.trim().is_empty() => {
            Err(shape_error("text_required", "Text messages need a body"))
        }
        MessageKind::Text => Ok(()),
        _ if payload.media_url.is_none() => {
            Err(shape_error("media_required", "Media messages need a media_url"))
        }
        _ => Ok(()),
    }
}

/// Send counters of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastProgress {
    pub sent_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
}

impl BroadcastProgress {
    pub fn processed(&self) -> i64 {
        self.sent_count + self.failed_count
    }
}

/// A bulk-send job through one device.
#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub recipient_spec: RecipientSpec,
    pub payload: MessagePayload,
    pub status: BroadcastStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub progress: BroadcastProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request payload for broadcast creation.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBroadcastRequest {
    pub device_id: Uuid,

    #[validate(custom(function = "validate_spec"))]
    pub recipient_spec: RecipientSpec,

    #[validate(nested)]
    pub payload: MessagePayload,

    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn validate_spec(spec: &RecipientSpec) -> Result<(), ValidationError> {
    spec.validate_shape()
}

/// Request payload for a single direct message.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SendMessageRequest {
    #[validate(custom(function = "validate_recipient"))]
    pub recipient: String,

    #[validate(nested)]
    pub payload: MessagePayload,
}

/// Why a single recipient was not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    QuotaExceeded,
    DeviceDisconnected,
    Timeout,
    Rejected(String),
    Internal(String),
}

impl SendFailure {
    pub fn code(&self) -> &'static str {
        match self {
            SendFailure::QuotaExceeded => "QuotaExceeded",
            SendFailure::DeviceDisconnected => "DeviceDisconnected",
            SendFailure::Timeout => "Timeout",
            SendFailure::Rejected(_) => "Rejected",
            SendFailure::Internal(_) => "Internal",
        }
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailure::Rejected(reason) | SendFailure::Internal(reason) => {
                write!(f, "{}: {}", self.code(), reason)
            }
            _ => f.write_str(self.code()),
        }
    }
}

/// Per-recipient delivery result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }
}

impl FromStr for RecipientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(RecipientStatus::Sent),
            "failed" => Ok(RecipientStatus::Failed),
            other => Err(format!("unknown recipient status: {}", other)),
        }
    }
}

/// Outcome log entry for one recipient of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientOutcome {
    pub broadcast_id: Uuid,
    pub position: i32,
    pub recipient: String,
    pub status: RecipientStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub at: DateTime<Utc>,
}
