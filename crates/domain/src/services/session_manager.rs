//! Registry of live device sessions.
//!
//! Each device gets one entry holding its state behind an async mutex, so
//! transitions for the same device are strictly ordered while different
//! devices proceed in parallel. Every transition is persisted before it
//! becomes visible in memory.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::Clock;
use super::messaging::{
    MessagingProvider, ProviderError, ProviderEvent, ProviderEventKind, SendReceipt,
};
use super::notifier::Notifier;
use super::session::{SessionInput, SessionState};
use crate::error::CoreError;
use crate::models::{
    DeviceStatus, DeviceStatusResponse, GatewayEvent, GatewayEventKind, MessagePayload, QrState,
};
use crate::store::DeviceStore;
use shared::crypto::fingerprint;

/// Session timing knobs.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long a QR payload stays scannable.
    pub qr_ttl: Duration,
    /// How long `connecting` may wait for the first QR or pairing.
    pub pairing_timeout: Duration,
    /// Upper bound for one provider send.
    pub send_timeout: Duration,
    /// Poll hint returned while the QR is still being generated.
    pub qr_retry_after_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            qr_ttl: Duration::from_secs(60),
            pairing_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_millis(15_000),
            qr_retry_after_secs: 2,
        }
    }
}

/// Failure of a single send through a device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Device not found")]
    NotFound,

    #[error("Device is not connected")]
    NotConnected,

    #[error("Send timed out")]
    Timeout,

    #[error("Provider rejected the message: {0}")]
    Rejected(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Provider unavailable: {0}")]
    Upstream(String),
}

impl From<SendError> for CoreError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NotFound => CoreError::NotFound("device".to_string()),
            SendError::NotConnected | SendError::SessionLost(_) => CoreError::NotConnected,
            SendError::Timeout => CoreError::Upstream("provider send timed out".to_string()),
            SendError::Rejected(reason) | SendError::Upstream(reason) => {
                CoreError::Upstream(reason)
            }
        }
    }
}

struct SessionSlot {
    state: SessionState,
    /// Bumped on every status change; deadline timers carry the value they
    /// were armed with and do nothing once it moved on.
    epoch: u64,
    /// Bumped on connect/reconnect; late pairing failures from an older
    /// attempt are ignored.
    attempt: u64,
    phase_started_at: DateTime<Utc>,
    deadline: Option<CancellationToken>,
}

struct DeviceEntry {
    user_id: Uuid,
    slot: Mutex<SessionSlot>,
    /// Serializes sends through the device across broadcasts.
    send_lock: Mutex<()>,
}

struct Inner {
    store: Arc<dyn DeviceStore>,
    provider: Arc<dyn MessagingProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    registry: RwLock<HashMap<Uuid, Arc<DeviceEntry>>>,
}

/// Owner of every device session. Cheap to clone.
#[derive(Clone)]
pub struct DeviceSessionManager {
    inner: Arc<Inner>,
}

impl DeviceSessionManager {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        provider: Arc<dyn MessagingProvider>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                notifier,
                clock,
                settings,
                registry: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Starts a fresh pairing. Accepted only from `disconnected` or `error`.
    pub async fn connect(&self, caller: Uuid, device_id: Uuid) -> Result<DeviceStatus, CoreError> {
        let entry = self.owned_entry(caller, device_id).await?;
        let attempt = {
            let mut slot = entry.slot.lock().await;
            self.apply(&entry, &mut slot, device_id, SessionInput::Connect)
                .await?;
            slot.attempt
        };

        self.spawn_pairing(device_id, attempt, None);
        Ok(DeviceStatus::Connecting)
    }

    /// Tears down whatever session exists and pairs again. Accepted from any
    /// state.
    pub async fn reconnect(
        &self,
        caller: Uuid,
        device_id: Uuid,
    ) -> Result<DeviceStatus, CoreError> {
        let entry = self.owned_entry(caller, device_id).await?;
        let (attempt, previous) = {
            let mut slot = entry.slot.lock().await;
            let previous = slot
                .state
                .status
                .is_live()
                .then(|| slot.state.session_token.clone());
            self.apply(&entry, &mut slot, device_id, SessionInput::Reconnect)
                .await?;
            (slot.attempt, previous)
        };

        self.spawn_pairing(device_id, attempt, previous);
        Ok(DeviceStatus::Connecting)
    }

    /// Ends the session. Returns once the new status is persisted; provider
    /// teardown continues in the background.
    pub async fn disconnect(
        &self,
        caller: Uuid,
        device_id: Uuid,
    ) -> Result<DeviceStatus, CoreError> {
        let entry = self.owned_entry(caller, device_id).await?;
        let token = {
            let mut slot = entry.slot.lock().await;
            let token = slot.state.session_token.clone();
            self.apply(&entry, &mut slot, device_id, SessionInput::Disconnect)
                .await?;
            token
        };

        self.spawn_teardown(device_id, token);
        Ok(DeviceStatus::Disconnected)
    }

    /// Current QR payload, a retry hint while it is being generated, or
    /// `InvalidState` when no QR applies.
    pub async fn get_qr(&self, caller: Uuid, device_id: Uuid) -> Result<QrState, CoreError> {
        let entry = self.owned_entry(caller, device_id).await?;
        let mut slot = entry.slot.lock().await;
        let ttl = self.chrono_qr_ttl();
        let now = self.inner.clock.now();
        let status = slot.state.status;

        match status {
            DeviceStatus::QrPending if slot.state.qr_expired(ttl, now) => {
                self.apply(&entry, &mut slot, device_id, SessionInput::QrExpired)
                    .await?;
                self.spawn_teardown(device_id, None);
                Err(CoreError::InvalidState(
                    "QR code expired, reconnect to get a new one".to_string(),
                ))
            }
            DeviceStatus::QrPending => {
                match (slot.state.qr_payload.clone(), slot.state.qr_issued_at) {
                    (Some(payload), Some(issued_at)) => Ok(QrState::Ready {
                        payload,
                        issued_at,
                        expires_at: issued_at + ttl,
                    }),
                    _ => Ok(QrState::Generating {
                        retry_after_seconds: self.inner.settings.qr_retry_after_secs,
                    }),
                }
            }
            DeviceStatus::Connecting => Ok(QrState::Generating {
                retry_after_seconds: self.inner.settings.qr_retry_after_secs,
            }),
            DeviceStatus::Connected => Err(CoreError::InvalidState(
                "device is already connected".to_string(),
            )),
            DeviceStatus::Disconnected | DeviceStatus::Error => Err(CoreError::InvalidState(
                "device must be connected first".to_string(),
            )),
        }
    }

    /// Pure read of the current state.
    pub async fn get_status(
        &self,
        caller: Uuid,
        device_id: Uuid,
    ) -> Result<DeviceStatusResponse, CoreError> {
        let entry = self.owned_entry(caller, device_id).await?;
        let slot = entry.slot.lock().await;
        Ok(DeviceStatusResponse {
            device_id,
            status: slot.state.status,
            last_activity_at: slot.state.last_activity_at,
            last_error: slot.state.last_error.clone(),
        })
    }

    /// Current status without an ownership check, for internal callers.
    pub async fn status_of(&self, device_id: Uuid) -> Result<DeviceStatus, CoreError> {
        let entry = self.entry(device_id).await?;
        let status = entry.slot.lock().await.state.status;
        Ok(status)
    }

    /// Fails unless `caller` owns the device.
    pub async fn authorize(&self, caller: Uuid, device_id: Uuid) -> Result<(), CoreError> {
        self.owned_entry(caller, device_id).await.map(|_| ())
    }

    /// Sends one message through a connected device.
    ///
    /// Sends through the same device are serialized. Provider failures leave
    /// the connection state alone unless the provider reports session loss,
    /// which moves the device to `error`.
    pub async fn send_through(
        &self,
        device_id: Uuid,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, SendError> {
        let entry = match self.entry(device_id).await {
            Ok(entry) => entry,
            Err(CoreError::NotFound(_)) => return Err(SendError::NotFound),
            Err(e) => return Err(SendError::Upstream(e.to_string())),
        };

        let _send_guard = entry.send_lock.lock().await;
        let token = {
            let slot = entry.slot.lock().await;
            match (slot.state.status, slot.state.session_token.clone()) {
                (DeviceStatus::Connected, Some(token)) => token,
                _ => return Err(SendError::NotConnected),
            }
        };

        let sent = tokio::time::timeout(
            self.inner.settings.send_timeout,
            self.inner.provider.send_message(&token, recipient, payload),
        )
        .await;

        match sent {
            Ok(Ok(receipt)) => {
                let mut slot = entry.slot.lock().await;
                if slot.state.session_token.as_deref() == Some(token.as_str()) {
                    if let Err(e) = self
                        .apply(&entry, &mut slot, device_id, SessionInput::MessageSent)
                        .await
                    {
                        tracing::warn!(device_id = %device_id, error = %e, "Failed to record activity");
                    }
                }
                Ok(receipt)
            }
            Ok(Err(ProviderError::SessionLost(reason))) => {
                self.on_session_lost(&entry, device_id, &token, reason.clone())
                    .await;
                Err(SendError::SessionLost(reason))
            }
            Ok(Err(ProviderError::Rejected(reason))) => Err(SendError::Rejected(reason)),
            Ok(Err(ProviderError::Transport(reason))) => Err(SendError::Upstream(reason)),
            Ok(Err(ProviderError::Timeout)) | Err(_) => {
                tracing::warn!(device_id = %device_id, "Provider send timed out");
                Err(SendError::Timeout)
            }
        }
    }

    /// Applies one provider event. Events that no longer fit the device's
    /// state are dropped.
    pub async fn handle_event(&self, event: ProviderEvent) {
        let device_id = event.device_id;
        let entry = match self.entry(device_id).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(device_id = %device_id, event = event.name(), error = %e, "Provider event for unknown device");
                return;
            }
        };

        let input = match event.kind {
            ProviderEventKind::QrCode { payload } => SessionInput::QrIssued { payload },
            ProviderEventKind::Paired { session_token } => SessionInput::Paired { session_token },
            ProviderEventKind::PairingFailed { reason } => SessionInput::PairingFailed { reason },
            ProviderEventKind::SessionDropped { reason } => SessionInput::SessionDropped { reason },
            ProviderEventKind::SessionInvalidated { reason } => {
                SessionInput::SessionInvalidated { reason }
            }
        };

        let mut slot = entry.slot.lock().await;
        match self.apply(&entry, &mut slot, device_id, input).await {
            Ok(()) => {}
            Err(CoreError::InvalidState(msg)) => {
                tracing::debug!(device_id = %device_id, reason = %msg, "Ignoring stale provider event");
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "Failed to apply provider event");
            }
        }
    }

    /// Feeds provider events into the manager until the channel closes.
    pub fn spawn_event_pump(&self, mut events: mpsc::Receiver<ProviderEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_event(event).await;
            }
            tracing::info!("Provider event pump stopped");
        })
    }

    /// Expires QR codes and pairing attempts past their deadline according
    /// to the injected clock. Returns how many sessions were failed.
    pub async fn expire_overdue(&self) -> usize {
        let entries: Vec<(Uuid, Arc<DeviceEntry>)> = self
            .inner
            .registry
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let now = self.inner.clock.now();
        let qr_ttl = self.chrono_qr_ttl();
        let pairing_timeout = to_chrono(self.inner.settings.pairing_timeout);
        let mut expired = 0;

        for (device_id, entry) in entries {
            let mut slot = entry.slot.lock().await;
            let input = match slot.state.status {
                DeviceStatus::QrPending if slot.state.qr_expired(qr_ttl, now) => {
                    SessionInput::QrExpired
                }
                DeviceStatus::Connecting if now >= slot.phase_started_at + pairing_timeout => {
                    SessionInput::PairingTimedOut
                }
                _ => continue,
            };

            match self.apply(&entry, &mut slot, device_id, input).await {
                Ok(()) => {
                    expired += 1;
                    self.spawn_teardown(device_id, None);
                }
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "Failed to expire session")
                }
            }
        }

        expired
    }

    /// Drops the device from the registry, ending any live session.
    pub async fn remove(&self, device_id: Uuid) -> bool {
        let Some(entry) = self.inner.registry.write().await.remove(&device_id) else {
            return false;
        };

        let mut slot = entry.slot.lock().await;
        if let Some(deadline) = slot.deadline.take() {
            deadline.cancel();
        }
        if slot.state.status.is_live() {
            let token = slot.state.session_token.take();
            if let Err(e) = self
                .inner
                .provider
                .end_session(device_id, token.as_deref())
                .await
            {
                tracing::warn!(device_id = %device_id, error = %e, "Provider teardown failed");
            }
            slot.state.status = DeviceStatus::Disconnected;
            self.inner.notifier.publish(GatewayEvent::for_device(
                entry.user_id,
                device_id,
                GatewayEventKind::DeviceDisconnected { device_id },
            ));
        }
        tracing::info!(device_id = %device_id, "Device session removed");
        true
    }

    /// Startup reset: no live provider handle survives a restart.
    pub async fn reset_live_sessions(&self) -> Result<u64, CoreError> {
        let reset = self.inner.store.reset_live_sessions().await?;
        self.inner.registry.write().await.clear();
        if reset > 0 {
            tracing::info!(count = reset, "Reset stale live sessions");
        }
        Ok(reset)
    }

    async fn owned_entry(
        &self,
        caller: Uuid,
        device_id: Uuid,
    ) -> Result<Arc<DeviceEntry>, CoreError> {
        let entry = self.entry(device_id).await?;
        if entry.user_id != caller {
            return Err(CoreError::Ownership(format!("device {}", device_id)));
        }
        Ok(entry)
    }

    async fn entry(&self, device_id: Uuid) -> Result<Arc<DeviceEntry>, CoreError> {
        if let Some(entry) = self.inner.registry.read().await.get(&device_id) {
            return Ok(Arc::clone(entry));
        }

        let device = self
            .inner
            .store
            .find(device_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("device {}", device_id)))?;

        let mut registry = self.inner.registry.write().await;
        // Another task may have loaded it while we were reading the store
        let entry = registry.entry(device_id).or_insert_with(|| {
            Arc::new(DeviceEntry {
                user_id: device.user_id,
                slot: Mutex::new(SessionSlot {
                    state: SessionState::from(&device),
                    epoch: 0,
                    attempt: 0,
                    phase_started_at: device.updated_at,
                    deadline: None,
                }),
                send_lock: Mutex::new(()),
            })
        });
        Ok(Arc::clone(entry))
    }

    /// Runs one transition: compute on a copy, persist, then publish.
    async fn apply(
        &self,
        entry: &DeviceEntry,
        slot: &mut SessionSlot,
        device_id: Uuid,
        input: SessionInput,
    ) -> Result<(), CoreError> {
        let now = self.inner.clock.now();
        let restarts_attempt = matches!(input, SessionInput::Connect | SessionInput::Reconnect);
        let refreshes_qr = matches!(input, SessionInput::QrIssued { .. });
        let input_name = input.name();

        let mut next = slot.state.clone();
        let events = next.apply(device_id, input, now)?;
        self.inner.store.save_session(&next.to_record(device_id)).await?;

        let previous = slot.state.status;
        slot.state = next;

        if previous != slot.state.status || restarts_attempt || refreshes_qr {
            slot.epoch += 1;
            slot.phase_started_at = now;
            if restarts_attempt {
                slot.attempt += 1;
            }
            self.arm_deadline(slot, device_id);

            metrics::counter!("device_transitions_total", "to" => slot.state.status.as_str())
                .increment(1);
            tracing::info!(
                device_id = %device_id,
                input = input_name,
                from = %previous,
                to = %slot.state.status,
                "Device session transition"
            );
            if let (DeviceStatus::Connected, Some(token)) =
                (slot.state.status, slot.state.session_token.as_deref())
            {
                tracing::info!(device_id = %device_id, session = %fingerprint(token), "Device paired");
            }
        }

        for kind in events {
            self.inner
                .notifier
                .publish(GatewayEvent::for_device(entry.user_id, device_id, kind));
        }
        Ok(())
    }

    fn arm_deadline(&self, slot: &mut SessionSlot, device_id: Uuid) {
        if let Some(previous) = slot.deadline.take() {
            previous.cancel();
        }

        let after = match slot.state.status {
            DeviceStatus::Connecting => self.inner.settings.pairing_timeout,
            DeviceStatus::QrPending => self.inner.settings.qr_ttl,
            _ => return,
        };

        let token = CancellationToken::new();
        slot.deadline = Some(token.clone());
        let epoch = slot.epoch;
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => manager.on_deadline(device_id, epoch).await,
            }
        });
    }

    async fn on_deadline(&self, device_id: Uuid, epoch: u64) {
        let Some(entry) = self.inner.registry.read().await.get(&device_id).cloned() else {
            return;
        };

        let mut slot = entry.slot.lock().await;
        if slot.epoch != epoch {
            return;
        }
        let input = match slot.state.status {
            DeviceStatus::QrPending => SessionInput::QrExpired,
            DeviceStatus::Connecting => SessionInput::PairingTimedOut,
            _ => return,
        };

        match self.apply(&entry, &mut slot, device_id, input).await {
            Ok(()) => self.spawn_teardown(device_id, None),
            Err(e) => {
                tracing::warn!(device_id = %device_id, error = %e, "Failed to expire session")
            }
        }
    }

    async fn on_session_lost(
        &self,
        entry: &DeviceEntry,
        device_id: Uuid,
        token: &str,
        reason: String,
    ) {
        let mut slot = entry.slot.lock().await;
        // A newer session may already have replaced the one that failed
        if slot.state.session_token.as_deref() != Some(token) {
            return;
        }
        if let Err(e) = self
            .apply(
                entry,
                &mut slot,
                device_id,
                SessionInput::SessionInvalidated { reason },
            )
            .await
        {
            tracing::error!(device_id = %device_id, error = %e, "Failed to record session loss");
        }
    }

    fn spawn_pairing(&self, device_id: Uuid, attempt: u64, previous: Option<Option<String>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Some(token) = previous {
                if let Err(e) = manager
                    .inner
                    .provider
                    .end_session(device_id, token.as_deref())
                    .await
                {
                    tracing::warn!(device_id = %device_id, error = %e, "Provider teardown before re-pairing failed");
                }
            }

            match manager.inner.provider.begin_pairing(device_id).await {
                Ok(handle) => {
                    tracing::debug!(device_id = %device_id, handle = %handle.handle_id, "Pairing started");
                }
                Err(e) => manager.on_pairing_error(device_id, attempt, e).await,
            }
        });
    }

    async fn on_pairing_error(&self, device_id: Uuid, attempt: u64, error: ProviderError) {
        tracing::warn!(device_id = %device_id, error = %error, "Pairing request failed");
        let Some(entry) = self.inner.registry.read().await.get(&device_id).cloned() else {
            return;
        };

        let mut slot = entry.slot.lock().await;
        if slot.attempt != attempt {
            return;
        }
        let input = SessionInput::PairingFailed {
            reason: error.to_string(),
        };
        if let Err(e) = self.apply(&entry, &mut slot, device_id, input).await {
            tracing::debug!(device_id = %device_id, error = %e, "Pairing failure arrived after state moved on");
        }
    }

    fn spawn_teardown(&self, device_id: Uuid, token: Option<String>) {
        let provider = Arc::clone(&self.inner.provider);
        tokio::spawn(async move {
            if let Err(e) = provider.end_session(device_id, token.as_deref()).await {
                tracing::warn!(device_id = %device_id, error = %e, "Provider teardown failed");
            }
        });
    }

    fn chrono_qr_ttl(&self) -> chrono::Duration {
        to_chrono(self.inner.settings.qr_ttl)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}
