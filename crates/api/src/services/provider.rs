//! HTTP client for the pairing/transport sidecar.
//!
//! The sidecar holds the actual messaging-network sessions. Pairing progress
//! and session loss come back through the signed callback endpoint, not
//! through these calls.

use async_trait::async_trait;
use domain::models::MessagePayload;
use domain::services::{MessagingProvider, PairingHandle, ProviderError, SendReceipt};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::ProviderConfig;

pub struct HttpMessagingProvider {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    recipient: &'a str,
    payload: &'a MessagePayload,
}

#[derive(Debug, Deserialize)]
struct SidecarError {
    #[serde(default)]
    message: String,
}

impl HttpMessagingProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ProviderError::Transport(format!("invalid base_url: {}", e)))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Transport("base_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn error_from(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let message = response
            .json::<SidecarError>()
            .await
            .map(|e| e.message)
            .unwrap_or_default();
        let reason = if message.is_empty() {
            status.to_string()
        } else {
            message
        };

        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::SessionLost(reason),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout,
            s if s.is_client_error() => ProviderError::Rejected(reason),
            _ => ProviderError::Transport(reason),
        }
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[async_trait]
impl MessagingProvider for HttpMessagingProvider {
    async fn begin_pairing(&self, device_id: Uuid) -> Result<PairingHandle, ProviderError> {
        let device_id = device_id.to_string();
        let url = self.endpoint(&["sessions", &device_id, "pair"])?;
        let response = self.client.post(url).send().await.map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response.json().await.map_err(transport_error)
    }

    async fn send_message(
        &self,
        session_token: &str,
        recipient: &str,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, ProviderError> {
        let url = self.endpoint(&["sessions", session_token, "messages"])?;
        let response = self
            .client
            .post(url)
            .json(&SendRequest { recipient, payload })
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        response.json().await.map_err(transport_error)
    }

    async fn end_session(
        &self,
        device_id: Uuid,
        session_token: Option<&str>,
    ) -> Result<(), ProviderError> {
        let device_id = device_id.to_string();
        let url = match session_token {
            Some(token) => self.endpoint(&["sessions", token])?,
            None => self.endpoint(&["pairings", &device_id])?,
        };
        let response = self.client.delete(url).send().await.map_err(transport_error)?;

        // Already gone is as good as ended
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }
}
