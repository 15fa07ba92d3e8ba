//! Messaging provider boundary.
//!
//! The provider owns the pairing handshake and the transport. The gateway
//! only sees three calls and an event feed reporting handshake progress and
//! session loss.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::MessagePayload;

/// Errors reported by a provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Provider call timed out")]
    Timeout,

    #[error("Provider session lost: {0}")]
    SessionLost(String),

    #[error("Provider transport error: {0}")]
    Transport(String),
}

/// Handle for an in-flight pairing handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingHandle {
    pub handle_id: String,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Asynchronous report from the provider about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub device_id: Uuid,
    #[serde(flatten)]
    pub kind: ProviderEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEventKind {
    /// Handshake produced (or refreshed) a scannable payload.
    QrCode { payload: String },
    /// Pairing succeeded.
    Paired { session_token: String },
    /// Handshake failed before pairing.
    PairingFailed { reason: String },
    /// Live session dropped; the device can simply connect again.
    SessionDropped {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Session invalidated remotely (logged out, banned).
    SessionInvalidated { reason: String },
}

impl ProviderEvent {
    pub fn new(device_id: Uuid, kind: ProviderEventKind) -> Self {
        Self { device_id, kind }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            ProviderEventKind::QrCode { .. } => "qr_code",
            ProviderEventKind::Paired { .. } => "paired",
            ProviderEventKind::PairingFailed { .. } => "pairing_failed",
            ProviderEventKind::SessionDropped { .. } => "session_dropped",
            ProviderEventKind::SessionInvalidated { .. } => "session_invalidated",
        }
    }
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Starts a pairing handshake. Progress arrives on the event feed.
    async fn begin_pairing(&self, device_id: Uuid) -> Result<PairingHandle, ProviderError>;

    async fn send_message(
        &self,
        session_token: &str,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, ProviderError>;

    /// Tears down whatever the provider holds for the device.
    async fn end_session(
        &self,
        device_id: Uuid,
        session_token: Option<&str>,
    ) -> Result<(), ProviderError>;
}

/// Scripted behavior of the mock for one recipient.
#[derive(Debug, Clone)]
pub enum MockSendBehavior {
    Reject(String),
    Timeout,
    SessionLost(String),
    /// Sleep before succeeding.
    Delay(Duration),
    /// Never answer.
    Hang,
    Panic,
}

/// A message accepted by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub session_token: String,
    pub recipient: String,
    pub payload: MessagePayload,
}

/// Provider double for development and tests.
#[derive(Debug, Default)]
pub struct MockMessagingProvider {
    event_sink: Mutex<Option<mpsc::Sender<ProviderEvent>>>,
    auto_qr: bool,
    pairing_failure: Mutex<Option<String>>,
    behaviors: Mutex<HashMap<String, MockSendBehavior>>,
    sent: Mutex<Vec<SentMessage>>,
    send_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    pairings: Mutex<Vec<Uuid>>,
    ended: Mutex<Vec<Uuid>>,
}

impl MockMessagingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits a `qr_code` event on `sink` for every pairing request.
    pub fn with_auto_qr(sink: mpsc::Sender<ProviderEvent>) -> Self {
        Self {
            event_sink: Mutex::new(Some(sink)),
            auto_qr: true,
            ..Self::default()
        }
    }

    pub fn fail_pairing(&self, reason: impl Into<String>) {
        if let Ok(mut failure) = self.pairing_failure.lock() {
            *failure = Some(reason.into());
        }
    }

    pub fn script(&self, recipient: impl Into<String>, behavior: MockSendBehavior) {
        if let Ok(mut behaviors) = self.behaviors.lock() {
            behaviors.insert(recipient.into(), behavior);
        }
    }

    /// Delays every unscripted send by `delay`.
    pub fn set_send_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.send_delay.lock() {
            *d = Some(delay);
        }
    }

    /// Highest number of sends observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_recipients(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.recipient).collect()
    }

    pub fn pairings(&self) -> Vec<Uuid> {
        self.pairings.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn ended(&self) -> Vec<Uuid> {
        self.ended.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Random payload shaped like a provider pairing string.
    pub fn random_qr_payload() -> String {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("2@{}", STANDARD.encode(bytes))
    }

    fn enter_send(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    fn behavior_for(&self, recipient: &str) -> Option<MockSendBehavior> {
        self.behaviors
            .lock()
            .ok()
            .and_then(|b| b.get(recipient).cloned())
    }
}

/// Counts a send as running until dropped, including when cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessagingProvider for MockMessagingProvider {
    async fn begin_pairing(&self, device_id: Uuid) -> Result<PairingHandle, ProviderError> {
        if let Some(reason) = self.pairing_failure.lock().ok().and_then(|f| f.clone()) {
            return Err(ProviderError::Transport(reason));
        }
        if let Ok(mut pairings) = self.pairings.lock() {
            pairings.push(device_id);
        }

        if self.auto_qr {
            let sink = self.event_sink.lock().ok().and_then(|s| s.clone());
            if let Some(sink) = sink {
                let event = ProviderEvent::new(
                    device_id,
                    ProviderEventKind::QrCode {
                        payload: Self::random_qr_payload(),
                    },
                );
                let _ = sink.send(event).await;
            }
        }

        Ok(PairingHandle {
            handle_id: Uuid::new_v4().to_string(),
        })
    }

    async fn send_message(
        &self,
        session_token: &str,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, ProviderError> {
        let _in_flight = self.enter_send();
        match self.behavior_for(recipient) {
            Some(MockSendBehavior::Reject(reason)) => return Err(ProviderError::Rejected(reason)),
            Some(MockSendBehavior::Timeout) => return Err(ProviderError::Timeout),
            Some(MockSendBehavior::SessionLost(reason)) => {
                return Err(ProviderError::SessionLost(reason))
            }
            Some(MockSendBehavior::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(MockSendBehavior::Hang) => std::future::pending::<()>().await,
            Some(MockSendBehavior::Panic) => panic!("scripted provider panic for {}", recipient),
            None => {
                let delay = self.send_delay.lock().ok().and_then(|d| *d);
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                session_token: session_token.to_string(),
                recipient: recipient.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(SendReceipt {
            message_id: Uuid::new_v4().to_string(),
        })
    }

    async fn end_session(
        &self,
        device_id: Uuid,
        _session_token: Option<&str>,
    ) -> Result<(), ProviderError> {
        if let Ok(mut ended) = self.ended.lock() {
            ended.push(device_id);
        }
        Ok(())
    }
}
