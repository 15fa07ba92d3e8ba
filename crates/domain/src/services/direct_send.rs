//! Single-message sends outside any broadcast.

use uuid::Uuid;
use validator::Validate;

use shared::validation::normalize_recipient;

use crate::error::CoreError;
use crate::models::quota::ResourceKind;
use crate::models::SendMessageRequest;
use crate::services::messaging::SendReceipt;
use crate::services::quota::QuotaEnforcer;
use crate::services::session_manager::DeviceSessionManager;

#[derive(Clone)]
pub struct DirectSender {
    sessions: DeviceSessionManager,
    quota: QuotaEnforcer,
}

impl DirectSender {
    pub fn new(sessions: DeviceSessionManager, quota: QuotaEnforcer) -> Self {
        Self { sessions, quota }
    }

    /// Sends one message through the caller's device.
    ///
    /// A `messages` unit is held for the duration of the send and only
    /// persisted once the provider accepts the message.
    pub async fn send(
        &self,
        caller: Uuid,
        device_id: Uuid,
        request: SendMessageRequest,
    ) -> Result<SendReceipt, CoreError> {
        request.validate()?;
        self.sessions.authorize(caller, device_id).await?;

        let recipient = normalize_recipient(&request.recipient)
            .ok_or_else(|| CoreError::Validation("invalid recipient".to_string()))?;

        let permit = self.quota.reserve(caller, ResourceKind::Messages).await?;
        let receipt = self
            .sessions
            .send_through(device_id, &recipient, &request.payload)
            .await?;

        if let Err(e) = self.quota.commit(permit).await {
            tracing::warn!(user_id = %caller, error = %e, "Failed to commit message quota");
        }

        tracing::info!(
            user_id = %caller,
            device_id = %device_id,
            message_id = %receipt.message_id,
            "Direct message sent"
        );
        Ok(receipt)
    }
}
