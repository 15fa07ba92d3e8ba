//! Broadcast execution.
//!
//! A run starts with a compare-and-swap into `running`, so a broadcast is
//! executed at most once no matter how many timers or poll jobs race for it.
//! Recipient failures are recorded and never abort the run.

use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::clock::Clock;
use super::contacts::ContactResolver;
use super::messaging::SendReceipt;
use super::notifier::Notifier;
use super::quota::QuotaEnforcer;
use super::session_manager::{DeviceSessionManager, SendError};
use crate::error::CoreError;
use crate::models::{
    Broadcast, BroadcastProgress, BroadcastStatus, GatewayEvent, GatewayEventKind,
    MessagePayload, RecipientOutcome, RecipientStatus, ResourceKind, SendFailure,
};
use crate::store::BroadcastStore;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Minimum spacing between send starts within one broadcast.
    pub pacing: Duration,
    /// Sends of one broadcast allowed in flight at once.
    pub max_in_flight: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(1_000),
            max_in_flight: 1,
        }
    }
}

/// Reason that fails every remaining recipient once set.
type Halt = Arc<Mutex<Option<SendFailure>>>;

/// Start instant of the most recent send of a run.
type Pacer = Arc<tokio::sync::Mutex<Option<Instant>>>;

struct DispatcherInner {
    broadcasts: Arc<dyn BroadcastStore>,
    sessions: DeviceSessionManager,
    contacts: Arc<dyn ContactResolver>,
    quota: QuotaEnforcer,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

#[derive(Clone)]
pub struct BroadcastDispatcher {
    inner: Arc<DispatcherInner>,
}

impl BroadcastDispatcher {
    pub fn new(
        broadcasts: Arc<dyn BroadcastStore>,
        sessions: DeviceSessionManager,
        contacts: Arc<dyn ContactResolver>,
        quota: QuotaEnforcer,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                broadcasts,
                sessions,
                contacts,
                quota,
                notifier,
                clock,
                settings,
            }),
        }
    }

    /// Moves the broadcast into `running` and spawns its execution.
    ///
    /// Returns `None` when the broadcast is no longer startable, e.g. it was
    /// cancelled or another trigger already started it.
    pub async fn start(
        &self,
        broadcast_id: Uuid,
    ) -> Result<Option<JoinHandle<BroadcastProgress>>, CoreError> {
        let now = self.inner.clock.now();
        let started = self
            .inner
            .broadcasts
            .transition(
                broadcast_id,
                &[BroadcastStatus::Scheduled, BroadcastStatus::Draft],
                BroadcastStatus::Running,
                now,
            )
            .await?;
        if !started {
            tracing::debug!(broadcast_id = %broadcast_id, "Broadcast not startable, skipping");
            return Ok(None);
        }

        let broadcast = match self.inner.broadcasts.find(broadcast_id).await {
            Ok(Some(broadcast)) => broadcast,
            loaded => {
                self.abandon(broadcast_id).await;
                return Err(match loaded {
                    Err(e) => e.into(),
                    Ok(_) => CoreError::NotFound(format!("broadcast {}", broadcast_id)),
                });
            }
        };

        let this = self.clone();
        Ok(Some(tokio::spawn(async move { this.execute(broadcast).await })))
    }

    /// Runs a broadcast that is already `running` to completion.
    pub async fn execute(&self, broadcast: Broadcast) -> BroadcastProgress {
        let broadcast_id = broadcast.id;
        let recipients = match self
            .inner
            .contacts
            .resolve(broadcast.user_id, &broadcast.recipient_spec)
            .await
        {
            Ok(recipients) => recipients,
            Err(e) => {
                tracing::error!(broadcast_id = %broadcast_id, error = %e, "Recipient resolution failed");
                return self
                    .finish(&broadcast, BroadcastStatus::Failed, BroadcastProgress::default())
                    .await;
            }
        };

        let mut progress = BroadcastProgress {
            sent_count: 0,
            failed_count: 0,
            total_count: recipients.len() as i64,
        };
        self.save_progress(broadcast_id, &progress).await;
        self.publish(
            &broadcast,
            GatewayEventKind::BroadcastStarted {
                broadcast_id,
                total: progress.total_count,
            },
        );
        tracing::info!(
            broadcast_id = %broadcast_id,
            device_id = %broadcast.device_id,
            total = progress.total_count,
            "Broadcast started"
        );

        let halt: Halt = Arc::new(Mutex::new(None));
        let payload = Arc::new(broadcast.payload.clone());
        let pacer: Pacer = Arc::new(tokio::sync::Mutex::new(None));
        let this = self.clone();
        let (user_id, device_id) = (broadcast.user_id, broadcast.device_id);

        let mut deliveries = stream::iter(recipients.into_iter().enumerate())
            .map(move |(position, recipient)| {
                let this = this.clone();
                let payload = Arc::clone(&payload);
                let halt = Arc::clone(&halt);
                let pacer = Arc::clone(&pacer);
                async move {
                    this.deliver(
                        broadcast_id,
                        user_id,
                        device_id,
                        position,
                        recipient,
                        payload,
                        halt,
                        pacer,
                    )
                    .await
                }
            })
            .buffer_unordered(self.inner.settings.max_in_flight.max(1));

        while let Some(outcome) = deliveries.next().await {
            match outcome.status {
                RecipientStatus::Sent => progress.sent_count += 1,
                RecipientStatus::Failed => progress.failed_count += 1,
            }
            metrics::counter!("broadcast_sends_total", "outcome" => outcome.status.as_str())
                .increment(1);

            if let Err(e) = self.inner.broadcasts.record_outcome(&outcome).await {
                tracing::warn!(broadcast_id = %broadcast_id, error = %e, "Failed to record recipient outcome");
            }
            self.save_progress(broadcast_id, &progress).await;
            self.publish(
                &broadcast,
                GatewayEventKind::BroadcastProgress {
                    broadcast_id,
                    sent: progress.sent_count,
                    failed: progress.failed_count,
                    total: progress.total_count,
                },
            );
        }

        let status = if progress.sent_count > 0 || progress.total_count == 0 {
            BroadcastStatus::Completed
        } else {
            BroadcastStatus::Failed
        };
        self.finish(&broadcast, status, progress).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver(
        &self,
        broadcast_id: Uuid,
        user_id: Uuid,
        device_id: Uuid,
        position: usize,
        recipient: String,
        payload: Arc<MessagePayload>,
        halt: Halt,
        pacer: Pacer,
    ) -> RecipientOutcome {
        let result = match halted(&halt) {
            Some(failure) => Err(failure),
            None => {
                wait_for_slot(&pacer, self.inner.settings.pacing).await;
                match halted(&halt) {
                    Some(failure) => Err(failure),
                    None => AssertUnwindSafe(self.send_one(
                        user_id, device_id, &recipient, &payload, &halt,
                    ))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        tracing::error!(broadcast_id = %broadcast_id, recipient = %recipient, "Send panicked");
                        Err(SendFailure::Internal("send panicked".to_string()))
                    }),
                }
            }
        };

        let at = self.inner.clock.now();
        match result {
            Ok(receipt) => RecipientOutcome {
                broadcast_id,
                position: position as i32,
                recipient,
                status: RecipientStatus::Sent,
                reason: None,
                provider_message_id: Some(receipt.message_id),
                at,
            },
            Err(failure) => {
                tracing::debug!(broadcast_id = %broadcast_id, recipient = %recipient, reason = %failure, "Recipient failed");
                RecipientOutcome {
                    broadcast_id,
                    position: position as i32,
                    recipient,
                    status: RecipientStatus::Failed,
                    reason: Some(failure.to_string()),
                    provider_message_id: None,
                    at,
                }
            }
        }
    }

    async fn send_one(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        recipient: &str,
        payload: &MessagePayload,
        halt: &Halt,
    ) -> Result<SendReceipt, SendFailure> {
        let permit = match self.inner.quota.reserve(user_id, ResourceKind::Messages).await {
            Ok(permit) => permit,
            Err(CoreError::QuotaExceeded { .. }) => {
                set_halt(halt, SendFailure::QuotaExceeded);
                return Err(SendFailure::QuotaExceeded);
            }
            Err(e) => return Err(SendFailure::Internal(e.to_string())),
        };

        match self
            .inner
            .sessions
            .send_through(device_id, recipient, payload)
            .await
        {
            Ok(receipt) => {
                if let Err(e) = self.inner.quota.commit(permit).await {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to commit message quota");
                }
                Ok(receipt)
            }
            Err(SendError::NotConnected | SendError::NotFound | SendError::SessionLost(_)) => {
                set_halt(halt, SendFailure::DeviceDisconnected);
                Err(SendFailure::DeviceDisconnected)
            }
            Err(SendError::Timeout) => Err(SendFailure::Timeout),
            Err(SendError::Rejected(reason) | SendError::Upstream(reason)) => {
                Err(SendFailure::Rejected(reason))
            }
        }
    }

    async fn finish(
        &self,
        broadcast: &Broadcast,
        status: BroadcastStatus,
        progress: BroadcastProgress,
    ) -> BroadcastProgress {
        let now = self.inner.clock.now();
        self.save_progress(broadcast.id, &progress).await;
        match self
            .inner
            .broadcasts
            .transition(broadcast.id, &[BroadcastStatus::Running], status, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(broadcast_id = %broadcast.id, "Broadcast left running state unexpectedly")
            }
            Err(e) => {
                tracing::error!(broadcast_id = %broadcast.id, error = %e, "Failed to finalize broadcast")
            }
        }

        self.publish(
            broadcast,
            GatewayEventKind::BroadcastCompleted {
                broadcast_id: broadcast.id,
                sent: progress.sent_count,
                failed: progress.failed_count,
                status,
            },
        );
        tracing::info!(
            broadcast_id = %broadcast.id,
            status = %status,
            sent = progress.sent_count,
            failed = progress.failed_count,
            total = progress.total_count,
            "Broadcast finished"
        );
        progress
    }

    /// Fails a broadcast that was claimed but could not be loaded.
    async fn abandon(&self, broadcast_id: Uuid) {
        let now = self.inner.clock.now();
        match self
            .inner
            .broadcasts
            .transition(
                broadcast_id,
                &[BroadcastStatus::Running],
                BroadcastStatus::Failed,
                now,
            )
            .await
        {
            Ok(_) => tracing::error!(broadcast_id = %broadcast_id, "Broadcast could not be loaded, marked failed"),
            Err(e) => {
                tracing::error!(broadcast_id = %broadcast_id, error = %e, "Failed to mark unloadable broadcast failed")
            }
        }
    }

    async fn save_progress(&self, broadcast_id: Uuid, progress: &BroadcastProgress) {
        if let Err(e) = self
            .inner
            .broadcasts
            .update_progress(broadcast_id, progress)
            .await
        {
            tracing::warn!(broadcast_id = %broadcast_id, error = %e, "Failed to save broadcast progress");
        }
    }

    fn publish(&self, broadcast: &Broadcast, kind: GatewayEventKind) {
        self.inner.notifier.publish(GatewayEvent::for_device(
            broadcast.user_id,
            broadcast.device_id,
            kind,
        ));
    }
}

/// Waits until `pacing` has passed since the previous send started, then
/// claims the slot. A slow send pushes every later start back.
async fn wait_for_slot(pacer: &Pacer, pacing: Duration) {
    if pacing.is_zero() {
        return;
    }
    let mut last_start = pacer.lock().await;
    if let Some(last) = *last_start {
        tokio::time::sleep_until(last + pacing).await;
    }
    *last_start = Some(Instant::now());
}

fn halted(halt: &Halt) -> Option<SendFailure> {
    halt.lock().ok().and_then(|h| h.clone())
}

fn set_halt(halt: &Halt, failure: SendFailure) {
    if let Ok(mut h) = halt.lock() {
        h.get_or_insert(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Device, MessagePayload, PlanLimits, QuotaLimit, RecipientSpec};
    use crate::services::clock::ManualClock;
    use crate::services::contacts::StaticContactResolver;
    use crate::services::messaging::{
        MockMessagingProvider, MockSendBehavior, ProviderEvent, ProviderEventKind,
    };
    use crate::services::notifier::RecordingNotifier;
    use crate::services::plans::FixedPlanRepository;
    use crate::services::quota::QuotaSettings;
    use crate::services::session_manager::SessionSettings;
    use crate::store::{InMemoryBroadcastStore, InMemoryDeviceStore, InMemoryQuotaStore};
    use chrono::Utc;

    struct Harness {
        dispatcher: BroadcastDispatcher,
        sessions: DeviceSessionManager,
        broadcasts: Arc<InMemoryBroadcastStore>,
        provider: Arc<MockMessagingProvider>,
        plans: Arc<FixedPlanRepository>,
        notifier: Arc<RecordingNotifier>,
        user: Uuid,
        device: Uuid,
    }

    async fn harness() -> Harness {
        let devices = Arc::new(InMemoryDeviceStore::new());
        let broadcasts = Arc::new(InMemoryBroadcastStore::new());
        let provider = Arc::new(MockMessagingProvider::new());
        let plans = Arc::new(FixedPlanRepository::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let user = Uuid::new_v4();
        let device = Device::new(user, "Sales", clock.now());
        let device_id = device.id;
        devices.insert(device).await;

        let sessions = DeviceSessionManager::new(
            devices,
            provider.clone(),
            notifier.clone(),
            clock.clone(),
            SessionSettings {
                send_timeout: Duration::from_millis(50),
                ..SessionSettings::default()
            },
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
            Arc::new(StaticContactResolver::new()),
            quota,
            notifier.clone(),
            clock,
            DispatchSettings {
                pacing: Duration::ZERO,
                max_in_flight: 1,
            },
        );

        sessions.connect(user, device_id).await.unwrap();
        sessions
            .handle_event(ProviderEvent::new(
                device_id,
                ProviderEventKind::Paired {
                    session_token: "tok".to_string(),
                },
            ))
            .await;

        Harness {
            dispatcher,
            sessions,
            broadcasts,
            provider,
            plans,
            notifier,
            user,
            device: device_id,
        }
    }

    fn recipients(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("141555501{:02}", i)).collect()
    }

    impl Harness {
        fn dispatcher_with(&self, settings: DispatchSettings) -> BroadcastDispatcher {
            let inner = &self.dispatcher.inner;
            BroadcastDispatcher::new(
                inner.broadcasts.clone(),
                inner.sessions.clone(),
                inner.contacts.clone(),
                inner.quota.clone(),
                inner.notifier.clone(),
                inner.clock.clone(),
                settings,
            )
        }

        async fn scheduled(&self, to: Vec<String>) -> Uuid {
            let broadcast = Broadcast {
                id: Uuid::new_v4(),
                user_id: self.user,
                device_id: self.device,
                recipient_spec: RecipientSpec::List { recipients: to },
                payload: MessagePayload::text("Spring sale"),
                status: BroadcastStatus::Scheduled,
                scheduled_at: Some(Utc::now()),
                progress: BroadcastProgress::default(),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            };
            self.broadcasts.insert(&broadcast).await.unwrap();
            broadcast.id
        }

        async fn run(&self, id: Uuid) -> Broadcast {
            let handle = self.dispatcher.start(id).await.unwrap().unwrap();
            handle.await.unwrap();
            self.broadcasts.find(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_partial_failure_counts_every_recipient() {
        let h = harness().await;
        let to = recipients(10);
        h.provider.script(to[4].clone(), MockSendBehavior::Hang);

        let id = h.scheduled(to).await;
        let broadcast = h.run(id).await;

        assert_eq!(broadcast.status, BroadcastStatus::Completed);
        assert_eq!(broadcast.progress.total_count, 10);
        assert_eq!(broadcast.progress.sent_count, 9);
        assert_eq!(broadcast.progress.failed_count, 1);
        assert!(broadcast.started_at.is_some());
        assert!(broadcast.completed_at.is_some());

        let outcomes = h.broadcasts.outcomes(id).await.unwrap();
        assert_eq!(outcomes.len(), 10);
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| o.status == RecipientStatus::Failed)
            .collect();
        assert_eq!(failed[0].position, 4);
        assert_eq!(failed[0].reason.as_deref(), Some("Timeout"));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_fails_remaining() {
        let h = harness().await;
        h.plans.set_limits(
            h.user,
            PlanLimits {
                messages: QuotaLimit::Limited(1),
                ..PlanLimits::unlimited()
            },
        );

        let id = h.scheduled(recipients(3)).await;
        let broadcast = h.run(id).await;

        assert_eq!(broadcast.status, BroadcastStatus::Completed);
        assert_eq!(broadcast.progress.sent_count, 1);
        assert_eq!(broadcast.progress.failed_count, 2);
        let outcomes = h.broadcasts.outcomes(id).await.unwrap();
        assert!(outcomes[1..]
            .iter()
            .all(|o| o.reason.as_deref() == Some("QuotaExceeded")));
        assert_eq!(h.provider.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_sends_do_not_consume_quota() {
        let h = harness().await;
        h.plans.set_limits(
            h.user,
            PlanLimits {
                messages: QuotaLimit::Limited(1),
                ..PlanLimits::unlimited()
            },
        );
        let to = recipients(2);
        h.provider
            .script(to[0].clone(), MockSendBehavior::Reject("invalid number".to_string()));

        let id = h.scheduled(to).await;
        let broadcast = h.run(id).await;
        assert_eq!(broadcast.progress.sent_count, 1);
        assert_eq!(broadcast.progress.failed_count, 1);
    }

    #[tokio::test]
    async fn test_session_loss_fails_remaining_as_disconnected() {
        let h = harness().await;
        let to = recipients(4);
        h.provider
            .script(to[1].clone(), MockSendBehavior::SessionLost("logged out".to_string()));

        let id = h.scheduled(to).await;
        let broadcast = h.run(id).await;

        assert_eq!(broadcast.status, BroadcastStatus::Completed);
        assert_eq!(broadcast.progress.sent_count, 1);
        assert_eq!(broadcast.progress.failed_count, 3);
        let outcomes = h.broadcasts.outcomes(id).await.unwrap();
        assert!(outcomes[1..]
            .iter()
            .all(|o| o.reason.as_deref() == Some("DeviceDisconnected")));
        assert_eq!(
            h.sessions.status_of(h.device).await.unwrap(),
            crate::models::DeviceStatus::Error
        );
    }

    #[tokio::test]
    async fn test_all_failed_marks_broadcast_failed() {
        let h = harness().await;
        h.sessions.disconnect(h.user, h.device).await.unwrap();

        let id = h.scheduled(recipients(2)).await;
        let broadcast = h.run(id).await;
        assert_eq!(broadcast.status, BroadcastStatus::Failed);
        assert_eq!(broadcast.progress.failed_count, 2);
    }

    #[tokio::test]
    async fn test_panicking_send_is_contained() {
        let h = harness().await;
        let to = recipients(3);
        h.provider.script(to[0].clone(), MockSendBehavior::Panic);

        let id = h.scheduled(to).await;
        let broadcast = h.run(id).await;
        assert_eq!(broadcast.progress.sent_count, 2);
        assert_eq!(broadcast.progress.failed_count, 1);
        let outcomes = h.broadcasts.outcomes(id).await.unwrap();
        assert_eq!(outcomes[0].reason.as_deref(), Some("Internal: send panicked"));
    }

    #[tokio::test]
    async fn test_start_is_exclusive() {
        let h = harness().await;
        let id = h.scheduled(recipients(1)).await;
        let first = h.dispatcher.start(id).await.unwrap();
        let second = h.dispatcher.start(id).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        first.unwrap().await.unwrap();
        assert_eq!(h.provider.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_claimed_but_unloadable_broadcast_is_failed() {
        let h = harness().await;
        let id = h.scheduled(recipients(2)).await;
        h.broadcasts.fail_finds(true);

        assert!(matches!(
            h.dispatcher.start(id).await,
            Err(CoreError::Storage(_))
        ));

        h.broadcasts.fail_finds(false);
        let broadcast = h.broadcasts.find(id).await.unwrap().unwrap();
        assert_eq!(broadcast.status, BroadcastStatus::Failed);
        assert!(broadcast.completed_at.is_some());
        assert!(h.provider.sent().is_empty());
        assert!(h.dispatcher.start(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_bracket_the_run() {
        let h = harness().await;
        let id = h.scheduled(recipients(2)).await;
        h.run(id).await;

        let names: Vec<_> = h
            .notifier
            .names()
            .into_iter()
            .filter(|n| n.starts_with("broadcast:"))
            .collect();
        assert_eq!(
            names,
            vec![
                "broadcast:started",
                "broadcast:progress",
                "broadcast:progress",
                "broadcast:completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_pacing_spaces_sends() {
        let h = harness().await;
        let paced = h.dispatcher_with(DispatchSettings {
            pacing: Duration::from_millis(20),
            max_in_flight: 1,
        });

        let id = h.scheduled(recipients(3)).await;
        let started = std::time::Instant::now();
        paced.start(id).await.unwrap().unwrap().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_slow_send_pushes_later_starts_back() {
        let h = harness().await;
        let paced = h.dispatcher_with(DispatchSettings {
            pacing: Duration::from_millis(20),
            max_in_flight: 1,
        });
        let to = recipients(4);
        // Times out after the 50ms send timeout; the next three starts must
        // still be 20ms apart from each other.
        h.provider.script(to[0].clone(), MockSendBehavior::Hang);

        let id = h.scheduled(to).await;
        let started = std::time::Instant::now();
        paced.start(id).await.unwrap().unwrap().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(h.provider.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_wide_window_still_sends_one_at_a_time_per_device() {
        let h = harness().await;
        let wide = h.dispatcher_with(DispatchSettings {
            pacing: Duration::ZERO,
            max_in_flight: 4,
        });
        h.provider.set_send_delay(Duration::from_millis(10));

        let id = h.scheduled(recipients(6)).await;
        wide.start(id).await.unwrap().unwrap().await.unwrap();

        let broadcast = h.broadcasts.find(id).await.unwrap().unwrap();
        assert_eq!(broadcast.status, BroadcastStatus::Completed);
        assert_eq!(broadcast.progress.sent_count, 6);
        assert_eq!(h.broadcasts.outcomes(id).await.unwrap().len(), 6);
        assert_eq!(h.provider.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_broadcasts_share_the_device_serially() {
        let h = harness().await;
        h.provider.set_send_delay(Duration::from_millis(10));
        let first = h.scheduled(recipients(3)).await;
        let second = h.scheduled(recipients(3)).await;

        let a = h.dispatcher.start(first).await.unwrap().unwrap();
        let b = h.dispatcher.start(second).await.unwrap().unwrap();
        a.await.unwrap();
        b.await.unwrap();

        for id in [first, second] {
            let broadcast = h.broadcasts.find(id).await.unwrap().unwrap();
            assert_eq!(broadcast.status, BroadcastStatus::Completed);
            assert_eq!(broadcast.progress.sent_count, 3);
        }
        assert_eq!(h.provider.sent().len(), 6);
        assert_eq!(h.provider.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_broadcasts_never_overshoot_quota() {
        let h = harness().await;
        h.plans.set_limits(
            h.user,
            PlanLimits {
                messages: QuotaLimit::Limited(3),
                ..PlanLimits::unlimited()
            },
        );
        let wide = h.dispatcher_with(DispatchSettings {
            pacing: Duration::ZERO,
            max_in_flight: 3,
        });
        h.provider.set_send_delay(Duration::from_millis(5));
        let first = h.scheduled(recipients(3)).await;
        let second = h.scheduled(recipients(3)).await;

        let a = wide.start(first).await.unwrap().unwrap();
        let b = wide.start(second).await.unwrap().unwrap();
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let sent = h.provider.sent().len();
        assert!((1..=3).contains(&sent));
        assert_eq!((a.sent_count + b.sent_count) as usize, sent);
        assert_eq!(a.sent_count + a.failed_count, 3);
        assert_eq!(b.sent_count + b.failed_count, 3);
    }
}
