//! Common test utilities for integration tests.
//!
//! The app is built on the in-memory stores and the mock provider, so these
//! tests need no database.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use domain::models::{PlanLimits, QuotaLimit};
use fake::faker::company::en::CompanyName;
use fake::Fake;
use domain::services::{
    FixedPlanRepository, MockMessagingProvider, ProviderEvent, ProviderEventKind,
    StaticContactResolver, SystemClock,
};
use domain::store::{InMemoryBroadcastStore, InMemoryDeviceStore, InMemoryQuotaStore};
use gateway_api::app::{create_app, AppState};
use gateway_api::config::Config;
use gateway_api::services::{Collaborators, CoreServices};
use serde_json::Value;
use shared::jwt::{TokenIssuer, TokenVerifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const CALLBACK_SECRET: &str = "test-callback-secret";

pub const ALL_SCOPES: &[&str] = &[
    "devices:read",
    "devices:manage",
    "broadcasts:read",
    "broadcasts:write",
    "messages:send",
    "events:subscribe",
];

pub struct TestApp {
    pub router: Router,
    pub services: CoreServices,
    pub provider: Arc<MockMessagingProvider>,
    pub plans: Arc<FixedPlanRepository>,
    pub contacts: Arc<StaticContactResolver>,
    issuer: TokenIssuer,
}

pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    Config::load_for_test(overrides).expect("test config")
}

/// Builds the full router on in-memory collaborators.
pub fn create_test_app() -> TestApp {
    create_test_app_with(&[])
}

pub fn create_test_app_with(overrides: &[(&str, &str)]) -> TestApp {
    let config = test_config(overrides);
    let provider = Arc::new(MockMessagingProvider::new());
    let plans = Arc::new(FixedPlanRepository::new());
    let contacts = Arc::new(StaticContactResolver::new());

    let collaborators = Collaborators {
        devices: Arc::new(InMemoryDeviceStore::new()),
        broadcasts: Arc::new(InMemoryBroadcastStore::new()),
        quotas: Arc::new(InMemoryQuotaStore::new()),
        contacts: contacts.clone(),
        plans: plans.clone(),
        provider: provider.clone(),
        clock: Arc::new(SystemClock),
    };
    let services = CoreServices::build(collaborators, &config).expect("core services");

    let (provider_tx, provider_rx) = mpsc::channel(64);
    services.sessions.spawn_event_pump(provider_rx);

    let state = AppState::new(
        config,
        services.clone(),
        TokenVerifier::from_secret(JWT_SECRET),
        provider_tx,
        None,
    );

    TestApp {
        router: create_app(state),
        services,
        provider,
        plans,
        contacts,
        issuer: TokenIssuer::from_secret(JWT_SECRET, 3600),
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub fn token(&self, user_id: Uuid, scopes: &[&str]) -> String {
        self.issuer.issue(user_id, scopes).unwrap()
    }

    /// A fresh user holding every capability.
    pub fn user(&self) -> (Uuid, String) {
        let user_id = Uuid::new_v4();
        (user_id, self.token(user_id, ALL_SCOPES))
    }

    pub fn set_limits(&self, user_id: Uuid, messages: i64, devices: i64, api_requests: i64) {
        self.plans.set_limits(
            user_id,
            PlanLimits {
                messages: QuotaLimit::Limited(messages),
                devices: QuotaLimit::Limited(devices),
                api_requests: QuotaLimit::Limited(api_requests),
            },
        );
    }

    /// Registers a device through the API and returns its id.
    pub async fn register_device(&self, token: &str, name: &str) -> Uuid {
        let response = self
            .send(json_request(
                Method::POST,
                "/devices",
                serde_json::json!({ "name": name }),
                token,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = parse_response_body(response).await;
        body["id"].as_str().unwrap().parse().unwrap()
    }

    /// Registers, connects and pairs a device.
    pub async fn paired_device(&self, token: &str) -> Uuid {
        let name: String = CompanyName().fake();
        let device_id = self.register_device(token, &name).await;
        let response = self
            .send(empty_request(
                Method::POST,
                &format!("/devices/{}/connect", device_id),
                token,
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        self.services
            .sessions
            .handle_event(ProviderEvent::new(
                device_id,
                ProviderEventKind::Paired {
                    session_token: format!("session-{}", device_id),
                },
            ))
            .await;
        device_id
    }

    /// Polls a broadcast until it reaches a terminal status.
    pub async fn wait_for_broadcast(&self, token: &str, broadcast_id: &str) -> Value {
        for _ in 0..100 {
            let response = self
                .send(get_request(&format!("/broadcasts/{}", broadcast_id), token))
                .await;
            let body = parse_response_body(response).await;
            match body["status"].as_str() {
                Some("draft") | Some("scheduled") | Some("running") => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                _ => return body,
            }
        }
        panic!("broadcast {} did not finish", broadcast_id);
    }
}

pub fn json_request(method: Method, uri: &str, body: Value, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: Method, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

pub fn get_request(uri: &str, token: &str) -> Request<Body> {
    empty_request(Method::GET, uri, token)
}

pub fn delete_request(uri: &str, token: &str) -> Request<Body> {
    empty_request(Method::DELETE, uri, token)
}

pub async fn parse_response_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap_or(Value::Null)
}
