//! Repository traits for loading and saving core records.
//!
//! The Postgres implementations live in the persistence crate; the in-memory
//! ones in [`memory`] back unit tests and local development.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Broadcast, BroadcastProgress, BroadcastStatus, Device, DeviceStatus, QuotaPeriod,
    RecipientOutcome, ResourceKind,
};

pub use memory::{InMemoryBroadcastStore, InMemoryDeviceStore, InMemoryQuotaStore};

/// Errors raised by repository implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Snapshot of a device's session columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSessionRecord {
    pub device_id: Uuid,
    pub status: DeviceStatus,
    pub session_token: Option<String>,
    pub qr_payload: Option<String>,
    pub qr_issued_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn create(&self, device: &Device) -> Result<(), StoreError>;

    async fn find(&self, device_id: Uuid) -> Result<Option<Device>, StoreError>;

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError>;

    /// Retires the device so it is no longer found or listed. Returns
    /// whether a live device was retired.
    async fn delete(&self, device_id: Uuid) -> Result<bool, StoreError>;

    /// Persists the session columns of one device.
    async fn save_session(&self, record: &DeviceSessionRecord) -> Result<(), StoreError>;

    /// Marks every device that claims a live session as disconnected.
    /// Returns the number of devices reset.
    async fn reset_live_sessions(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait BroadcastStore: Send + Sync {
    async fn insert(&self, broadcast: &Broadcast) -> Result<(), StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<Broadcast>, StoreError>;

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Broadcast>, StoreError>;

    /// Atomically moves the broadcast to `to` if its current status is one
    /// of `from`. Sets `started_at` when entering `running` and
    /// `completed_at` when entering a terminal status. Returns whether the
    /// swap happened.
    async fn transition(
        &self,
        id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn update_progress(
        &self,
        id: Uuid,
        progress: &BroadcastProgress,
    ) -> Result<(), StoreError>;

    async fn record_outcome(&self, outcome: &RecipientOutcome) -> Result<(), StoreError>;

    async fn outcomes(&self, id: Uuid) -> Result<Vec<RecipientOutcome>, StoreError>;

    /// Scheduled broadcasts whose `scheduled_at` is at or before `until`.
    async fn find_scheduled_until(
        &self,
        until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, StoreError>;

    /// Scheduled broadcasts that target the device.
    async fn find_scheduled_for_device(&self, device_id: Uuid) -> Result<Vec<Broadcast>, StoreError>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Counter value for the period, zero when no counter exists yet.
    async fn current(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
    ) -> Result<i64, StoreError>;

    /// Atomically increments the counter by one unless that would exceed
    /// `limit`. Returns the new count, or `None` when the limit is reached.
    async fn try_increment(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
        limit: Option<i64>,
    ) -> Result<Option<i64>, StoreError>;
}
