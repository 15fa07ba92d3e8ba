//! Broadcast and recipient outcome entities.

use chrono::{DateTime, Utc};
use domain::models::{
    Broadcast, BroadcastProgress, BroadcastStatus, MessagePayload, RecipientOutcome,
    RecipientSpec, RecipientStatus,
};
use domain::store::StoreError;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Database row mapping for the broadcasts table.
#[derive(Debug, Clone, FromRow)]
pub struct BroadcastEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub recipient_spec: Json<RecipientSpec>,
    pub payload: Json<MessagePayload>,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_count: i64,
    pub failed_count: i64,
    pub total_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BroadcastEntity> for Broadcast {
    type Error = StoreError;

    fn try_from(entity: BroadcastEntity) -> Result<Self, Self::Error> {
        let status: BroadcastStatus = entity.status.parse().map_err(StoreError::Corrupt)?;
        Ok(Self {
            id: entity.id,
            user_id: entity.user_id,
            device_id: entity.device_id,
            recipient_spec: entity.recipient_spec.0,
            payload: entity.payload.0,
            status,
            scheduled_at: entity.scheduled_at,
            progress: BroadcastProgress {
                sent_count: entity.sent_count,
                failed_count: entity.failed_count,
                total_count: entity.total_count,
            },
            created_at: entity.created_at,
            started_at: entity.started_at,
            completed_at: entity.completed_at,
        })
    }
}

/// Database row mapping for the broadcast_recipients table.
#[derive(Debug, Clone, FromRow)]
pub struct BroadcastRecipientEntity {
    pub broadcast_id: Uuid,
    pub position: i32,
    pub recipient: String,
    pub status: String,
    pub reason: Option<String>,
    pub provider_message_id: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl TryFrom<BroadcastRecipientEntity> for RecipientOutcome {
    type Error = StoreError;

    fn try_from(entity: BroadcastRecipientEntity) -> Result<Self, Self::Error> {
        let status: RecipientStatus = entity.status.parse().map_err(StoreError::Corrupt)?;
        Ok(Self {
            broadcast_id: entity.broadcast_id,
            position: entity.position,
            recipient: entity.recipient,
            status,
            reason: entity.reason,
            provider_message_id: entity.provider_message_id,
            at: entity.processed_at,
        })
    }
}
