//! Device registration and removal.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::CoreError;
use crate::models::quota::ResourceKind;
use crate::models::Device;
use crate::services::broadcast_scheduler::BroadcastScheduler;
use crate::services::clock::Clock;
use crate::services::quota::QuotaEnforcer;
use crate::services::session_manager::DeviceSessionManager;
use crate::store::DeviceStore;

const MAX_DEVICE_NAME_LEN: usize = 100;

/// Owns the device rows themselves; connection state belongs to
/// [`DeviceSessionManager`].
#[derive(Clone)]
pub struct DeviceDirectory {
    store: Arc<dyn DeviceStore>,
    sessions: DeviceSessionManager,
    broadcasts: BroadcastScheduler,
    quota: QuotaEnforcer,
    clock: Arc<dyn Clock>,
}

impl DeviceDirectory {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        sessions: DeviceSessionManager,
        broadcasts: BroadcastScheduler,
        quota: QuotaEnforcer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            sessions,
            broadcasts,
            quota,
            clock,
        }
    }

    /// Registers a new, disconnected device. Consumes one `devices` unit.
    pub async fn register(&self, caller: Uuid, name: &str) -> Result<Device, CoreError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_DEVICE_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "device name must be 1-{} characters",
                MAX_DEVICE_NAME_LEN
            )));
        }

        self.quota.consume(caller, ResourceKind::Devices).await?;

        let device = Device::new(caller, name, self.clock.now());
        self.store.create(&device).await?;

        tracing::info!(user_id = %caller, device_id = %device.id, "Device registered");
        Ok(device)
    }

    pub async fn list(&self, caller: Uuid) -> Result<Vec<Device>, CoreError> {
        Ok(self.store.list_for_user(caller).await?)
    }

    /// Retires the device, cancels its scheduled broadcasts and tears down
    /// any live session.
    ///
    /// The row goes first so a concurrent connect can no longer load the
    /// device once its session entry is dropped. Broadcast history stays.
    pub async fn delete(&self, caller: Uuid, device_id: Uuid) -> Result<(), CoreError> {
        self.sessions.authorize(caller, device_id).await?;

        if !self.store.delete(device_id).await? {
            return Err(CoreError::NotFound(format!("device {}", device_id)));
        }
        let cancelled = match self.broadcasts.cancel_for_device(device_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "Failed to cancel broadcasts of deleted device");
                0
            }
        };
        self.sessions.remove(device_id).await;

        tracing::info!(user_id = %caller, device_id = %device_id, cancelled, "Device deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::quota::{PlanLimits, QuotaLimit};
    use crate::models::DeviceStatus;
    use crate::services::clock::ManualClock;
    use crate::services::messaging::{MockMessagingProvider, ProviderEvent, ProviderEventKind};
    use crate::services::notifier::RecordingNotifier;
    use crate::services::plans::FixedPlanRepository;
    use crate::services::quota::QuotaSettings;
    use crate::services::session_manager::SessionSettings;
    use crate::models::{BroadcastStatus, CreateBroadcastRequest, MessagePayload, RecipientSpec};
    use crate::services::contacts::StaticContactResolver;
    use crate::services::dispatcher::{BroadcastDispatcher, DispatchSettings};
    use crate::store::{BroadcastStore, InMemoryBroadcastStore, InMemoryDeviceStore, InMemoryQuotaStore};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    struct Harness {
        directory: DeviceDirectory,
        sessions: DeviceSessionManager,
        scheduler: BroadcastScheduler,
        store: Arc<InMemoryDeviceStore>,
        broadcasts: Arc<InMemoryBroadcastStore>,
        provider: Arc<MockMessagingProvider>,
        clock: Arc<ManualClock>,
        user: Uuid,
    }

    fn harness(device_limit: i64) -> Harness {
        let store = Arc::new(InMemoryDeviceStore::new());
        let provider = Arc::new(MockMessagingProvider::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let plans = Arc::new(FixedPlanRepository::new());
        let user = Uuid::new_v4();
        plans.set_limits(
            user,
            PlanLimits {
                messages: QuotaLimit::Unlimited,
                devices: QuotaLimit::Limited(device_limit),
                api_requests: QuotaLimit::Unlimited,
            },
        );

        let notifier = Arc::new(RecordingNotifier::new());
        let sessions = DeviceSessionManager::new(
            store.clone(),
            provider.clone(),
            notifier.clone(),
            clock.clone(),
            SessionSettings::default(),
        );
        let quota = QuotaEnforcer::new(
            Arc::new(InMemoryQuotaStore::new()),
            plans,
            clock.clone(),
            QuotaSettings::default(),
        );
        let broadcasts = Arc::new(InMemoryBroadcastStore::new());
        let contacts = Arc::new(StaticContactResolver::new());
        let dispatcher = BroadcastDispatcher::new(
            broadcasts.clone(),
            sessions.clone(),
            contacts.clone(),
            quota.clone(),
            notifier,
            clock.clone(),
            DispatchSettings {
                pacing: Duration::ZERO,
                max_in_flight: 1,
            },
        );
        let scheduler = BroadcastScheduler::new(
            broadcasts.clone(),
            sessions.clone(),
            contacts,
            dispatcher,
            clock.clone(),
        );
        let directory = DeviceDirectory::new(
            store.clone(),
            sessions.clone(),
            scheduler.clone(),
            quota,
            clock.clone(),
        );
        Harness {
            directory,
            sessions,
            scheduler,
            store,
            broadcasts,
            provider,
            clock,
            user,
        }
    }

    impl Harness {
        async fn paired_device(&self) -> Device {
            let device = self.directory.register(self.user, "Front desk").await.unwrap();
            self.sessions.connect(self.user, device.id).await.unwrap();
            self.sessions
                .handle_event(ProviderEvent::new(
                    device.id,
                    ProviderEventKind::Paired {
                        session_token: "tok".to_string(),
                    },
                ))
                .await;
            device
        }
    }

    #[tokio::test]
    async fn test_register_consumes_device_quota() {
        let h = harness(1);

        let device = h.directory.register(h.user, "  Front desk ").await.unwrap();
        assert_eq!(device.name, "Front desk");
        assert_eq!(device.status, DeviceStatus::Disconnected);

        let err = h.directory.register(h.user, "Second").await.unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { .. }));
        assert_eq!(h.directory.list(h.user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_blank_name() {
        let h = harness(5);
        let err = h.directory.register(h.user, "   ").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_tears_down_live_session() {
        let h = harness(5);
        let device = h.paired_device().await;

        h.directory.delete(h.user, device.id).await.unwrap();

        assert_eq!(h.provider.ended().len(), 1);
        assert!(h.store.find(device.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_after_delete_finds_nothing() {
        let h = harness(5);
        let device = h.paired_device().await;
        h.directory.delete(h.user, device.id).await.unwrap();

        let err = h.sessions.connect(h.user, device.id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(matches!(
            h.directory.delete(h.user, device.id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_cancels_scheduled_broadcasts() {
        let h = harness(5);
        let device = h.paired_device().await;
        let scheduled = h
            .scheduler
            .create(
                h.user,
                CreateBroadcastRequest {
                    device_id: device.id,
                    recipient_spec: RecipientSpec::List {
                        recipients: vec!["+14155550100".to_string()],
                    },
                    payload: MessagePayload::text("Doors open at 9"),
                    scheduled_at: Some(h.clock.now() + ChronoDuration::hours(1)),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.scheduler.pending_timers(), 1);

        h.directory.delete(h.user, device.id).await.unwrap();

        let kept = h.broadcasts.find(scheduled.id).await.unwrap().unwrap();
        assert_eq!(kept.status, BroadcastStatus::Cancelled);
        assert_eq!(h.scheduler.pending_timers(), 0);
        h.clock.advance(ChronoDuration::hours(2));
        assert_eq!(h.scheduler.dispatch_due(10).await.unwrap(), 0);
        assert!(h.provider.sent().is_empty());
    }

    #[tokio::test]
    async fn test_delete_requires_ownership() {
        let h = harness(5);
        let device = h.directory.register(h.user, "Front desk").await.unwrap();

        let err = h
            .directory
            .delete(Uuid::new_v4(), device.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Ownership(_)));
        assert!(h.store.find(device.id).await.unwrap().is_some());
    }
}
