//! Broadcast intake, timers and cancellation.
//!
//! Timers are an in-memory shortcut only: every scheduled broadcast is
//! persisted with its `scheduled_at`, and [`BroadcastScheduler::dispatch_due`]
//! picks up whatever a lost timer missed. Cancel and dispatch-start are both
//! compare-and-swaps on the stored status, so exactly one of them wins.

use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::Validate;

use super::clock::Clock;
use super::contacts::ContactResolver;
use super::dispatcher::BroadcastDispatcher;
use super::session_manager::DeviceSessionManager;
use crate::error::CoreError;
use crate::models::{
    Broadcast, BroadcastProgress, BroadcastStatus, CreateBroadcastRequest, DeviceStatus,
    RecipientOutcome,
};
use crate::store::BroadcastStore;
use shared::validation::validate_future_instant;

/// How far ahead startup recovery re-arms timers.
const RESTORE_HORIZON_DAYS: i64 = 366;

/// Most broadcasts re-armed or dispatched per recovery pass.
const RESTORE_BATCH: i64 = 10_000;

struct SchedulerInner {
    broadcasts: Arc<dyn BroadcastStore>,
    sessions: DeviceSessionManager,
    contacts: Arc<dyn ContactResolver>,
    dispatcher: BroadcastDispatcher,
    clock: Arc<dyn Clock>,
    timers: Mutex<HashMap<Uuid, CancellationToken>>,
}

#[derive(Clone)]
pub struct BroadcastScheduler {
    inner: Arc<SchedulerInner>,
}

impl BroadcastScheduler {
    pub fn new(
        broadcasts: Arc<dyn BroadcastStore>,
        sessions: DeviceSessionManager,
        contacts: Arc<dyn ContactResolver>,
        dispatcher: BroadcastDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                broadcasts,
                sessions,
                contacts,
                dispatcher,
                clock,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validates and persists a broadcast, then either arms its timer or
    /// starts it right away.
    pub async fn create(
        &self,
        caller: Uuid,
        request: CreateBroadcastRequest,
    ) -> Result<Broadcast, CoreError> {
        request.validate()?;

        self.inner.sessions.authorize(caller, request.device_id).await?;
        if self.inner.sessions.status_of(request.device_id).await? != DeviceStatus::Connected {
            return Err(CoreError::NotConnected);
        }

        let recipients = self
            .inner
            .contacts
            .resolve(caller, &request.recipient_spec)
            .await?;
        if recipients.is_empty() {
            return Err(CoreError::EmptyRecipients);
        }

        let now = self.inner.clock.now();
        if let Some(at) = request.scheduled_at {
            validate_future_instant(at, now).map_err(|_| {
                CoreError::InvalidSchedule(format!(
                    "scheduled_at {} is not after {}",
                    at.to_rfc3339(),
                    now.to_rfc3339()
                ))
            })?;
        }

        let mut broadcast = Broadcast {
            id: Uuid::new_v4(),
            user_id: caller,
            device_id: request.device_id,
            recipient_spec: request.recipient_spec,
            payload: request.payload,
            status: if request.scheduled_at.is_some() {
                BroadcastStatus::Scheduled
            } else {
                BroadcastStatus::Draft
            },
            scheduled_at: request.scheduled_at,
            progress: BroadcastProgress {
                total_count: recipients.len() as i64,
                ..BroadcastProgress::default()
            },
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.inner.broadcasts.insert(&broadcast).await?;

        match broadcast.scheduled_at {
            Some(at) => {
                self.arm(broadcast.id, at);
                tracing::info!(
                    broadcast_id = %broadcast.id,
                    device_id = %broadcast.device_id,
                    scheduled_at = %at,
                    recipients = recipients.len(),
                    "Broadcast scheduled"
                );
            }
            None => match self.inner.dispatcher.start(broadcast.id).await {
                Ok(Some(_)) => {
                    broadcast.status = BroadcastStatus::Running;
                    broadcast.started_at = Some(now);
                }
                Ok(None) => {}
                Err(e) => {
                    self.fail_unstarted(broadcast.id).await;
                    return Err(e);
                }
            },
        }

        Ok(broadcast)
    }

    /// Cancels a scheduled broadcast. Fails with `TooLate` once dispatch
    /// has started.
    pub async fn cancel(&self, caller: Uuid, broadcast_id: Uuid) -> Result<Broadcast, CoreError> {
        self.owned(caller, broadcast_id).await?;

        let now = self.inner.clock.now();
        let cancelled = self
            .inner
            .broadcasts
            .transition(
                broadcast_id,
                &[BroadcastStatus::Scheduled],
                BroadcastStatus::Cancelled,
                now,
            )
            .await?;

        let broadcast = self.owned(caller, broadcast_id).await?;
        if cancelled {
            self.disarm(broadcast_id);
            tracing::info!(broadcast_id = %broadcast_id, "Broadcast cancelled");
            return Ok(broadcast);
        }

        match broadcast.status {
            BroadcastStatus::Cancelled => Err(CoreError::Conflict(format!(
                "broadcast {} is already cancelled",
                broadcast_id
            ))),
            status => Err(CoreError::TooLate(format!(
                "broadcast {} is already {}",
                broadcast_id, status
            ))),
        }
    }

    pub async fn get(&self, caller: Uuid, broadcast_id: Uuid) -> Result<Broadcast, CoreError> {
        self.owned(caller, broadcast_id).await
    }

    /// The caller's broadcasts, newest first.
    pub async fn list(
        &self,
        caller: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Broadcast>, CoreError> {
        Ok(self
            .inner
            .broadcasts
            .list_for_user(caller, limit, offset)
            .await?)
    }

    /// Per-recipient outcomes recorded so far.
    pub async fn outcomes(
        &self,
        caller: Uuid,
        broadcast_id: Uuid,
    ) -> Result<Vec<RecipientOutcome>, CoreError> {
        self.owned(caller, broadcast_id).await?;
        let mut outcomes = self.inner.broadcasts.outcomes(broadcast_id).await?;
        outcomes.sort_by_key(|o| o.position);
        Ok(outcomes)
    }

    /// Starts every scheduled broadcast whose time has come. Returns how
    /// many were started by this call.
    pub async fn dispatch_due(&self, limit: i64) -> Result<usize, CoreError> {
        let now = self.inner.clock.now();
        let due = self
            .inner
            .broadcasts
            .find_scheduled_until(now, limit)
            .await?;

        let mut started = 0;
        for broadcast in due {
            self.disarm(broadcast.id);
            match self.inner.dispatcher.start(broadcast.id).await {
                Ok(Some(_)) => started += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(broadcast_id = %broadcast.id, error = %e, "Failed to start due broadcast")
                }
            }
        }
        if started > 0 {
            tracing::info!(count = started, "Dispatched due broadcasts");
        }
        Ok(started)
    }

    /// Re-arms timers for persisted scheduled broadcasts after a restart and
    /// dispatches the overdue ones. Returns how many timers were armed.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        let now = self.inner.clock.now();
        let until = now + ChronoDuration::days(RESTORE_HORIZON_DAYS);
        let pending = self
            .inner
            .broadcasts
            .find_scheduled_until(until, RESTORE_BATCH)
            .await?;

        let mut armed = 0;
        for broadcast in pending {
            match broadcast.scheduled_at {
                Some(at) if at > now => {
                    self.arm(broadcast.id, at);
                    armed += 1;
                }
                _ => {
                    if let Err(e) = self.inner.dispatcher.start(broadcast.id).await {
                        tracing::warn!(broadcast_id = %broadcast.id, error = %e, "Failed to start overdue broadcast");
                    }
                }
            }
        }
        tracing::info!(armed, "Restored broadcast timers");
        Ok(armed)
    }

    /// Cancels every scheduled broadcast of a device that is going away.
    /// Running broadcasts are left to fail their remaining recipients once
    /// the session is gone. Returns how many were cancelled.
    pub async fn cancel_for_device(&self, device_id: Uuid) -> Result<usize, CoreError> {
        let now = self.inner.clock.now();
        let pending = self
            .inner
            .broadcasts
            .find_scheduled_for_device(device_id)
            .await?;

        let mut cancelled = 0;
        for broadcast in pending {
            let swapped = self
                .inner
                .broadcasts
                .transition(
                    broadcast.id,
                    &[BroadcastStatus::Scheduled],
                    BroadcastStatus::Cancelled,
                    now,
                )
                .await?;
            if swapped {
                self.disarm(broadcast.id);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(device_id = %device_id, count = cancelled, "Cancelled broadcasts of deleted device");
        }
        Ok(cancelled)
    }

    /// Number of armed timers.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn arm(&self, broadcast_id: Uuid, at: chrono::DateTime<chrono::Utc>) {
        let delay = (at - self.inner.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let token = CancellationToken::new();
        if let Ok(mut timers) = self.inner.timers.lock() {
            if let Some(previous) = timers.insert(broadcast_id, token.clone()) {
                previous.cancel();
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.fire(broadcast_id).await,
            }
        });
    }

    fn disarm(&self, broadcast_id: Uuid) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            if let Some(token) = timers.remove(&broadcast_id) {
                token.cancel();
            }
        }
    }

    async fn fire(&self, broadcast_id: Uuid) {
        if let Ok(mut timers) = self.inner.timers.lock() {
            timers.remove(&broadcast_id);
        }
        match self.inner.dispatcher.start(broadcast_id).await {
            Ok(Some(_)) => {
                tracing::info!(broadcast_id = %broadcast_id, "Scheduled broadcast fired")
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(broadcast_id = %broadcast_id, error = %e, "Failed to start scheduled broadcast")
            }
        }
    }

    /// Marks an immediate broadcast failed when it could not be started.
    async fn fail_unstarted(&self, broadcast_id: Uuid) {
        let now = self.inner.clock.now();
        if let Err(e) = self
            .inner
            .broadcasts
            .transition(
                broadcast_id,
                &[BroadcastStatus::Draft],
                BroadcastStatus::Failed,
                now,
            )
            .await
        {
            tracing::error!(broadcast_id = %broadcast_id, error = %e, "Failed to mark unstarted broadcast failed");
        }
    }

    async fn owned(&self, caller: Uuid, broadcast_id: Uuid) -> Result<Broadcast, CoreError> {
        let broadcast = self
            .inner
            .broadcasts
            .find(broadcast_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("broadcast {}", broadcast_id)))?;
        if broadcast.user_id != caller {
            return Err(CoreError::Ownership(format!("broadcast {}", broadcast_id)));
        }
        Ok(broadcast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Device, MessagePayload, PlanLimits, QuotaLimit, RecipientSpec, RecipientStatus,
    };
    use crate::services::clock::ManualClock;
    use crate::services::contacts::StaticContactResolver;
    use crate::services::dispatcher::DispatchSettings;
    use crate::services::messaging::{MockMessagingProvider, ProviderEvent, ProviderEventKind};
    use crate::services::notifier::RecordingNotifier;
    use crate::services::plans::FixedPlanRepository;
    use crate::services::quota::{QuotaEnforcer, QuotaSettings};
    use crate::services::session_manager::SessionSettings;
    use crate::store::{InMemoryBroadcastStore, InMemoryDeviceStore, InMemoryQuotaStore};
    use chrono::Utc;
    use std::time::Duration;

    struct Harness {
        scheduler: BroadcastScheduler,
        sessions: DeviceSessionManager,
        broadcasts: Arc<InMemoryBroadcastStore>,
        provider: Arc<MockMessagingProvider>,
        contacts: Arc<StaticContactResolver>,
        plans: Arc<FixedPlanRepository>,
        clock: Arc<ManualClock>,
        user: Uuid,
        device: Uuid,
    }

    async fn harness() -> Harness {
        let devices = Arc::new(InMemoryDeviceStore::new());
        let broadcasts = Arc::new(InMemoryBroadcastStore::new());
        let provider = Arc::new(MockMessagingProvider::new());
        let contacts = Arc::new(StaticContactResolver::new());
        let plans = Arc::new(FixedPlanRepository::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let user = Uuid::new_v4();
        let device = Device::new(user, "Marketing", clock.now());
        let device_id = device.id;
        devices.insert(device).await;
        plans.set_limits(user, PlanLimits::unlimited());

        let sessions = DeviceSessionManager::new(
            devices,
            provider.clone(),
            notifier.clone(),
            clock.clone(),
            SessionSettings::default(),
        );
        let quota = QuotaEnforcer::new(
            Arc::new(InMemoryQuotaStore::new()),
            plans.clone(),
            clock.clone(),
            QuotaSettings::default(),
        );
        let dispatcher = BroadcastDispatcher::new(
            broadcasts.clone(),
            sessions.clone(),
            contacts.clone(),
            quota,
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
            contacts.clone(),
            dispatcher,
            clock.clone(),
        );

        Harness {
            scheduler,
            sessions,
            broadcasts,
            provider,
            contacts,
            plans,
            clock,
            user,
            device: device_id,
        }
    }

    impl Harness {
        async fn pair(&self) {
            self.sessions.connect(self.user, self.device).await.unwrap();
            self.sessions
                .handle_event(ProviderEvent::new(
                    self.device,
                    ProviderEventKind::Paired {
                        session_token: "tok".to_string(),
                    },
                ))
                .await;
        }

        fn request(&self, to: &[&str], at: Option<chrono::DateTime<Utc>>) -> CreateBroadcastRequest {
            CreateBroadcastRequest {
                device_id: self.device,
                recipient_spec: RecipientSpec::List {
                    recipients: to.iter().map(|r| r.to_string()).collect(),
                },
                payload: MessagePayload::text("Store opens at 9"),
                scheduled_at: at,
            }
        }

        async fn settle(&self, id: Uuid) -> Broadcast {
            for _ in 0..400 {
                let b = self.broadcasts.find(id).await.unwrap().unwrap();
                if b.status.is_terminal() {
                    return b;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("broadcast {} never finished", id);
        }
    }

    const THREE: [&str; 3] = ["+14155550100", "+14155550101", "+14155550102"];

    #[tokio::test]
    async fn test_create_requires_connected_device() {
        let h = harness().await;
        let err = h
            .scheduler
            .create(h.user, h.request(&THREE, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotConnected));

        let err = h
            .scheduler
            .create(Uuid::new_v4(), h.request(&THREE, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Ownership(_)));
    }

    #[tokio::test]
    async fn test_past_schedule_rejected() {
        let h = harness().await;
        h.pair().await;
        for at in [h.clock.now(), h.clock.now() - ChronoDuration::seconds(1)] {
            let err = h
                .scheduler
                .create(h.user, h.request(&THREE, Some(at)))
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::InvalidSchedule(_)));
        }
        assert!(h.broadcasts.list_for_user(h.user, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_filter_rejected() {
        let h = harness().await;
        h.pair().await;
        let mut request = h.request(&THREE, None);
        request.recipient_spec = RecipientSpec::Filter {
            tags: vec!["nobody".to_string()],
            match_all: false,
        };
        let err = h.scheduler.create(h.user, request).await.unwrap_err();
        assert!(matches!(err, CoreError::EmptyRecipients));
    }

    #[tokio::test]
    async fn test_filter_resolves_contacts() {
        let h = harness().await;
        h.pair().await;
        h.contacts.add_contact(h.user, "+14155550123", &["vip"]);
        let mut request = h.request(&THREE, None);
        request.recipient_spec = RecipientSpec::Filter {
            tags: vec!["vip".to_string()],
            match_all: false,
        };
        let created = h.scheduler.create(h.user, request).await.unwrap();
        let done = h.settle(created.id).await;
        assert_eq!(done.progress.sent_count, 1);
        assert_eq!(h.provider.sent_recipients(), vec!["14155550123"]);
    }

    #[tokio::test]
    async fn test_cancel_before_fire_sends_nothing() {
        let h = harness().await;
        h.pair().await;
        let at = h.clock.now() + ChronoDuration::seconds(60);
        let created = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(at)))
            .await
            .unwrap();
        assert_eq!(created.status, BroadcastStatus::Scheduled);
        assert_eq!(h.scheduler.pending_timers(), 1);

        let cancelled = h.scheduler.cancel(h.user, created.id).await.unwrap();
        assert_eq!(cancelled.status, BroadcastStatus::Cancelled);
        assert_eq!(h.scheduler.pending_timers(), 0);

        // A late poll finds nothing to start
        h.clock.advance(ChronoDuration::seconds(120));
        assert_eq!(h.scheduler.dispatch_due(100).await.unwrap(), 0);
        assert!(h.provider.sent().is_empty());

        assert!(matches!(
            h.scheduler.cancel(h.user, created.id).await,
            Err(CoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_start_is_too_late() {
        let h = harness().await;
        h.pair().await;
        let created = h
            .scheduler
            .create(h.user, h.request(&THREE, None))
            .await
            .unwrap();
        assert_eq!(created.status, BroadcastStatus::Running);

        assert!(matches!(
            h.scheduler.cancel(h.user, created.id).await,
            Err(CoreError::TooLate(_))
        ));
        let done = h.settle(created.id).await;
        assert_eq!(done.status, BroadcastStatus::Completed);
        assert_eq!(done.progress.sent_count, 3);
    }

    #[tokio::test]
    async fn test_cancel_and_fire_race_has_one_winner() {
        let h = harness().await;
        h.pair().await;

        for round in 0..20u64 {
            let at = h.clock.now() + ChronoDuration::milliseconds(10);
            let created = h
                .scheduler
                .create(h.user, h.request(&["+14155550199"], Some(at)))
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(5 + round % 10)).await;
            let cancel = h.scheduler.cancel(h.user, created.id).await;
            let outcomes_after_cancel = h.broadcasts.outcomes(created.id).await.unwrap();

            match cancel {
                Ok(b) => {
                    assert_eq!(b.status, BroadcastStatus::Cancelled);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let b = h.broadcasts.find(created.id).await.unwrap().unwrap();
                    assert_eq!(b.status, BroadcastStatus::Cancelled);
                    assert!(outcomes_after_cancel.is_empty());
                    assert!(h.broadcasts.outcomes(created.id).await.unwrap().is_empty());
                }
                Err(CoreError::TooLate(_)) => {
                    let b = h.settle(created.id).await;
                    assert_eq!(b.status, BroadcastStatus::Completed);
                    assert_eq!(b.progress.processed(), 1);
                }
                Err(e) => panic!("unexpected cancel error {:?}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_due_picks_up_missed_timers() {
        let h = harness().await;
        h.pair().await;
        let at = h.clock.now() + ChronoDuration::hours(1);
        let created = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(at)))
            .await
            .unwrap();

        assert_eq!(h.scheduler.dispatch_due(100).await.unwrap(), 0);
        h.clock.advance(ChronoDuration::hours(1));
        assert_eq!(h.scheduler.dispatch_due(100).await.unwrap(), 1);
        assert_eq!(h.scheduler.pending_timers(), 0);

        let done = h.settle(created.id).await;
        assert_eq!(done.progress.sent_count, 3);
        assert_eq!(h.scheduler.dispatch_due(100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_restore_rearms_future_and_runs_overdue() {
        let h = harness().await;
        h.pair().await;
        let now = h.clock.now();
        let future = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(now + ChronoDuration::hours(2))))
            .await
            .unwrap();
        let overdue = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(now + ChronoDuration::hours(1))))
            .await
            .unwrap();

        // Simulate a restart an hour and a half later
        let restarted = BroadcastScheduler::new(
            h.broadcasts.clone(),
            h.sessions.clone(),
            h.contacts.clone(),
            h.scheduler.inner.dispatcher.clone(),
            h.clock.clone(),
        );
        h.clock.advance(ChronoDuration::minutes(90));
        assert_eq!(restarted.restore().await.unwrap(), 1);
        assert_eq!(restarted.pending_timers(), 1);

        let done = h.settle(overdue.id).await;
        assert_eq!(done.status, BroadcastStatus::Completed);
        let pending = h.broadcasts.find(future.id).await.unwrap().unwrap();
        assert_eq!(pending.status, BroadcastStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_failed_start_does_not_strand_immediate_broadcast() {
        let h = harness().await;
        h.pair().await;
        h.broadcasts.fail_next_transition();

        let err = h
            .scheduler
            .create(h.user, h.request(&THREE, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));

        let stored = h.broadcasts.list_for_user(h.user, 10, 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, BroadcastStatus::Failed);
        assert!(stored[0].completed_at.is_some());
        assert!(h.provider.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unloadable_broadcast_after_claim_is_failed() {
        let h = harness().await;
        h.pair().await;
        h.broadcasts.fail_finds(true);

        let err = h
            .scheduler
            .create(h.user, h.request(&THREE, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));

        h.broadcasts.fail_finds(false);
        let stored = h.broadcasts.list_for_user(h.user, 10, 0).await.unwrap();
        assert_eq!(stored[0].status, BroadcastStatus::Failed);
        assert!(h.provider.sent().is_empty());
    }

    #[tokio::test]
    async fn test_restore_continues_past_a_failed_start() {
        let h = harness().await;
        h.pair().await;
        let now = h.clock.now();
        let first = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(now + ChronoDuration::minutes(1))))
            .await
            .unwrap();
        let second = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(now + ChronoDuration::minutes(2))))
            .await
            .unwrap();
        let later = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(now + ChronoDuration::hours(1))))
            .await
            .unwrap();

        let restarted = BroadcastScheduler::new(
            h.broadcasts.clone(),
            h.sessions.clone(),
            h.contacts.clone(),
            h.scheduler.inner.dispatcher.clone(),
            h.clock.clone(),
        );
        h.clock.advance(ChronoDuration::minutes(5));
        // The oldest overdue broadcast is started first and hits the failure
        h.broadcasts.fail_next_transition();
        assert_eq!(restarted.restore().await.unwrap(), 1);

        let skipped = h.broadcasts.find(first.id).await.unwrap().unwrap();
        assert_eq!(skipped.status, BroadcastStatus::Scheduled);
        assert_eq!(h.settle(second.id).await.status, BroadcastStatus::Completed);
        let pending = h.broadcasts.find(later.id).await.unwrap().unwrap();
        assert_eq!(pending.status, BroadcastStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_cancel_for_device_only_touches_scheduled() {
        let h = harness().await;
        h.pair().await;
        let at = h.clock.now() + ChronoDuration::hours(1);
        let first = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(at)))
            .await
            .unwrap();
        let second = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(at)))
            .await
            .unwrap();
        let immediate = h
            .scheduler
            .create(h.user, h.request(&THREE, None))
            .await
            .unwrap();
        h.settle(immediate.id).await;
        assert_eq!(h.scheduler.pending_timers(), 2);

        assert_eq!(h.scheduler.cancel_for_device(h.device).await.unwrap(), 2);
        assert_eq!(h.scheduler.pending_timers(), 0);
        for id in [first.id, second.id] {
            let b = h.broadcasts.find(id).await.unwrap().unwrap();
            assert_eq!(b.status, BroadcastStatus::Cancelled);
        }
        let done = h.broadcasts.find(immediate.id).await.unwrap().unwrap();
        assert_eq!(done.status, BroadcastStatus::Completed);
        assert_eq!(h.scheduler.cancel_for_device(h.device).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_scenario_one_permit_left() {
        let h = harness().await;
        h.pair().await;
        h.plans.set_limits(
            h.user,
            PlanLimits {
                messages: QuotaLimit::Limited(1),
                ..PlanLimits::unlimited()
            },
        );

        let created = h
            .scheduler
            .create(h.user, h.request(&THREE[..2], None))
            .await
            .unwrap();
        let done = h.settle(created.id).await;

        assert_eq!(done.status, BroadcastStatus::Completed);
        assert_eq!(done.progress.sent_count, 1);
        assert_eq!(done.progress.failed_count, 1);
        let outcomes = h.scheduler.outcomes(h.user, created.id).await.unwrap();
        assert_eq!(outcomes[0].status, RecipientStatus::Sent);
        assert_eq!(outcomes[1].reason.as_deref(), Some("QuotaExceeded"));
    }

    #[tokio::test]
    async fn test_reads_are_owner_scoped() {
        let h = harness().await;
        h.pair().await;
        let created = h
            .scheduler
            .create(h.user, h.request(&THREE, Some(h.clock.now() + ChronoDuration::hours(1))))
            .await
            .unwrap();

        assert_eq!(h.scheduler.get(h.user, created.id).await.unwrap().id, created.id);
        assert!(matches!(
            h.scheduler.get(Uuid::new_v4(), created.id).await,
            Err(CoreError::Ownership(_))
        ));
        assert!(matches!(
            h.scheduler.get(h.user, Uuid::new_v4()).await,
            Err(CoreError::NotFound(_))
        ));
        assert_eq!(h.scheduler.list(h.user, 10, 0).await.unwrap().len(), 1);
        assert!(h.scheduler.list(Uuid::new_v4(), 10, 0).await.unwrap().is_empty());
    }
}
