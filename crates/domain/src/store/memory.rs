//! In-memory repository implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BroadcastStore, DeviceSessionRecord, DeviceStore, QuotaStore, StoreError};
use crate::models::{
    Broadcast, BroadcastProgress, BroadcastStatus, Device, QuotaPeriod, RecipientOutcome,
    ResourceKind,
};

#[derive(Debug, Default)]
pub struct InMemoryDeviceStore {
    devices: RwLock<HashMap<Uuid, Device>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a device record.
    pub async fn insert(&self, device: Device) {
        self.devices.write().await.insert(device.id, device);
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        self.insert(device.clone()).await;
        Ok(())
    }

    async fn find(&self, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        Ok(self.devices.read().await.get(&device_id).cloned())
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        let mut owned: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(owned)
    }

    async fn delete(&self, device_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.devices.write().await.remove(&device_id).is_some())
    }

    async fn save_session(&self, record: &DeviceSessionRecord) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(&record.device_id) {
            device.status = record.status;
            device.session_token = record.session_token.clone();
            device.qr_payload = record.qr_payload.clone();
            device.qr_issued_at = record.qr_issued_at;
            device.last_error = record.last_error.clone();
            device.last_activity_at = record.last_activity_at;
            device.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_live_sessions(&self) -> Result<u64, StoreError> {
        let mut devices = self.devices.write().await;
        let mut reset = 0;
        for device in devices.values_mut().filter(|d| d.status.is_live()) {
            device.status = crate::models::DeviceStatus::Disconnected;
            device.session_token = None;
            device.qr_payload = None;
            device.qr_issued_at = None;
            reset += 1;
        }
        Ok(reset)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBroadcastStore {
    broadcasts: RwLock<HashMap<Uuid, Broadcast>>,
    outcomes: RwLock<HashMap<Uuid, Vec<RecipientOutcome>>>,
    failing_finds: AtomicBool,
    failing_transition: AtomicBool,
}

impl InMemoryBroadcastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `find` fail until switched off again.
    pub fn fail_finds(&self, fail: bool) {
        self.failing_finds.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `transition` fail.
    pub fn fail_next_transition(&self) {
        self.failing_transition.store(true, Ordering::SeqCst);
    }

    fn unavailable() -> StoreError {
        StoreError::Corrupt("broadcast store unavailable".to_string())
    }
}

#[async_trait]
impl BroadcastStore for InMemoryBroadcastStore {
    async fn insert(&self, broadcast: &Broadcast) -> Result<(), StoreError> {
        self.broadcasts
            .write()
            .await
            .insert(broadcast.id, broadcast.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Broadcast>, StoreError> {
        if self.failing_finds.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.broadcasts.read().await.get(&id).cloned())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Broadcast>, StoreError> {
        let broadcasts = self.broadcasts.read().await;
        let mut owned: Vec<Broadcast> = broadcasts
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[BroadcastStatus],
        to: BroadcastStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if self.failing_transition.swap(false, Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let mut broadcasts = self.broadcasts.write().await;
        let Some(broadcast) = broadcasts.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&broadcast.status) {
            return Ok(false);
        }

        broadcast.status = to;
        if to == BroadcastStatus::Running {
            broadcast.started_at = Some(at);
        }
        if to.is_terminal() {
            broadcast.completed_at = Some(at);
        }
        Ok(true)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: &BroadcastProgress,
    ) -> Result<(), StoreError> {
        if let Some(broadcast) = self.broadcasts.write().await.get_mut(&id) {
            broadcast.progress = *progress;
        }
        Ok(())
    }

    async fn record_outcome(&self, outcome: &RecipientOutcome) -> Result<(), StoreError> {
        self.outcomes
            .write()
            .await
            .entry(outcome.broadcast_id)
            .or_default()
            .push(outcome.clone());
        Ok(())
    }

    async fn outcomes(&self, id: Uuid) -> Result<Vec<RecipientOutcome>, StoreError> {
        Ok(self
            .outcomes
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_scheduled_until(
        &self,
        until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, StoreError> {
        let broadcasts = self.broadcasts.read().await;
        let mut due: Vec<Broadcast> = broadcasts
            .values()
            .filter(|b| b.status == BroadcastStatus::Scheduled)
            .filter(|b| b.scheduled_at.map(|at| at <= until).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|b| b.scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn find_scheduled_for_device(&self, device_id: Uuid) -> Result<Vec<Broadcast>, StoreError> {
        let mut pending: Vec<Broadcast> = self
            .broadcasts
            .read()
            .await
            .values()
            .filter(|b| b.device_id == device_id && b.status == BroadcastStatus::Scheduled)
            .cloned()
            .collect();
        pending.sort_by_key(|b| b.scheduled_at);
        Ok(pending)
    }
}

type CounterKey = (Uuid, ResourceKind, DateTime<Utc>);

/// Counters behind one mutex, so increment-if-below-limit is atomic.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    counters: Mutex<HashMap<CounterKey, i64>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a counter, for tests that start mid-period.
    pub fn set(&self, user_id: Uuid, resource: ResourceKind, period: &QuotaPeriod, count: i64) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.insert((user_id, resource, period.start), count);
        }
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn current(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
    ) -> Result<i64, StoreError> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| StoreError::Corrupt("quota counters poisoned".to_string()))?;
        Ok(counters
            .get(&(user_id, resource, period.start))
            .copied()
            .unwrap_or(0))
    }

    async fn try_increment(
        &self,
        user_id: Uuid,
        resource: ResourceKind,
        period: &QuotaPeriod,
        limit: Option<i64>,
    ) -> Result<Option<i64>, StoreError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| StoreError::Corrupt("quota counters poisoned".to_string()))?;
        let count = counters.entry((user_id, resource, period.start)).or_insert(0);
        if limit.map(|l| *count >= l).unwrap_or(false) {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessagePayload, RecipientSpec};
    use chrono::{Duration, FixedOffset};

    fn broadcast(user_id: Uuid, status: BroadcastStatus, at: Option<DateTime<Utc>>) -> Broadcast {
        Broadcast {
            id: Uuid::new_v4(),
            user_id,
            device_id: Uuid::new_v4(),
            recipient_spec: RecipientSpec::List {
                recipients: vec!["14155550100".to_string()],
            },
            payload: MessagePayload::text("hi"),
            status,
            scheduled_at: at,
            progress: BroadcastProgress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = InMemoryBroadcastStore::new();
        let b = broadcast(Uuid::new_v4(), BroadcastStatus::Scheduled, None);
        store.insert(&b).await.unwrap();

        let now = Utc::now();
        assert!(store
            .transition(b.id, &[BroadcastStatus::Scheduled], BroadcastStatus::Cancelled, now)
            .await
            .unwrap());
        assert!(!store
            .transition(b.id, &[BroadcastStatus::Scheduled], BroadcastStatus::Running, now)
            .await
            .unwrap());

        let stored = store.find(b.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BroadcastStatus::Cancelled);
        assert_eq!(stored.completed_at, Some(now));
        assert!(stored.started_at.is_none());
    }

    #[tokio::test]
    async fn test_find_scheduled_until() {
        let store = InMemoryBroadcastStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let due = broadcast(user, BroadcastStatus::Scheduled, Some(now - Duration::seconds(5)));
        let later = broadcast(user, BroadcastStatus::Scheduled, Some(now + Duration::hours(1)));
        let cancelled = broadcast(user, BroadcastStatus::Cancelled, Some(now - Duration::seconds(5)));
        for b in [&due, &later, &cancelled] {
            store.insert(b).await.unwrap();
        }

        let found = store.find_scheduled_until(now, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_find_scheduled_for_device() {
        let store = InMemoryBroadcastStore::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let pending = broadcast(user, BroadcastStatus::Scheduled, Some(now + Duration::hours(1)));
        let mut finished = broadcast(user, BroadcastStatus::Completed, Some(now));
        finished.device_id = pending.device_id;
        let elsewhere = broadcast(user, BroadcastStatus::Scheduled, Some(now + Duration::hours(1)));
        for b in [&pending, &finished, &elsewhere] {
            store.insert(b).await.unwrap();
        }

        let found = store.find_scheduled_for_device(pending.device_id).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, pending.id);
    }

    #[tokio::test]
    async fn test_quota_try_increment_respects_limit() {
        let store = InMemoryQuotaStore::new();
        let user = Uuid::new_v4();
        let period = QuotaPeriod::containing(Utc::now(), FixedOffset::east_opt(0).unwrap());

        assert_eq!(
            store.try_increment(user, ResourceKind::Messages, &period, Some(2)).await.unwrap(),
            Some(1)
        );
        assert_eq!(
            store.try_increment(user, ResourceKind::Messages, &period, Some(2)).await.unwrap(),
            Some(2)
        );
        assert_eq!(
            store.try_increment(user, ResourceKind::Messages, &period, Some(2)).await.unwrap(),
            None
        );
        assert_eq!(
            store.current(user, ResourceKind::Messages, &period).await.unwrap(),
            2
        );
        assert_eq!(
            store.try_increment(user, ResourceKind::Messages, &period, None).await.unwrap(),
            Some(3)
        );
    }

    #[tokio::test]
    async fn test_reset_live_sessions() {
        let store = InMemoryDeviceStore::new();
        let mut device = Device::new(Uuid::new_v4(), "Shop", Utc::now());
        device.status = crate::models::DeviceStatus::Connected;
        device.session_token = Some("token".to_string());
        store.insert(device.clone()).await;
        store
            .insert(Device::new(Uuid::new_v4(), "Idle", Utc::now()))
            .await;

        assert_eq!(store.reset_live_sessions().await.unwrap(), 1);
        let reloaded = store.find(device.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, crate::models::DeviceStatus::Disconnected);
        assert!(reloaded.session_token.is_none());
    }
}
