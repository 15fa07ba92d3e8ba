//! Integration tests for quota accounting and the request gate.

mod common;

use axum::http::{Method, StatusCode};
use common::{create_test_app, create_test_app_with, empty_request, get_request, parse_response_body};
use serde_json::Value;

fn usage_of<'a>(body: &'a Value, resource: &str) -> &'a Value {
    body["usage"]
        .as_array()
        .unwrap()
        .iter()
        .find(|u| u["resource"] == resource)
        .unwrap()
}

#[tokio::test]
async fn test_usage_reports_every_resource() {
    let app = create_test_app();
    let (_, token) = app.user();
    app.register_device(&token, "Front desk").await;

    let response = app.send(get_request("/quota", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_response_body(response).await;

    assert_eq!(body["usage"].as_array().unwrap().len(), 3);
    assert_eq!(usage_of(&body, "devices")["current"], 1);
    assert_eq!(usage_of(&body, "devices")["limit"], 5);
    assert_eq!(usage_of(&body, "messages")["current"], 0);
    assert_eq!(usage_of(&body, "api_requests")["allowed"], true);
}

#[tokio::test]
async fn test_gated_endpoints_consume_api_requests() {
    let app = create_test_app();
    let (user_id, token) = app.user();
    app.set_limits(user_id, 100, 5, 1);
    let device_id = app.register_device(&token, "Front desk").await;
    let connect = format!("/devices/{}/connect", device_id);

    let response = app.send(empty_request(Method::POST, &connect, &token)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .send(empty_request(
            Method::POST,
            &format!("/devices/{}/reconnect", device_id),
            &token,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = parse_response_body(response).await;
    assert_eq!(body["error"], "QUOTA_EXCEEDED");
    assert_eq!(body["resource"], "api_requests");
    assert_eq!(body["current"], 1);
    assert_eq!(body["limit"], 1);

    // Ungated reads keep working
    let response = app
        .send(get_request(&format!("/devices/{}/status", device_id), &token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_direct_send_stops_at_message_limit() {
    let app = create_test_app();
    let (user_id, token) = app.user();
    app.set_limits(user_id, 1, 5, 100);
    let device_id = app.paired_device(&token).await;
    let uri = format!("/devices/{}/messages", device_id);
    let body = serde_json::json!({
        "recipient": "15550102030",
        "payload": { "type": "text", "text": "hello" }
    });

    let response = app
        .send(common::json_request(Method::POST, &uri, body.clone(), &token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .send(common::json_request(Method::POST, &uri, body, &token))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(parse_response_body(response).await["resource"], "messages");
    assert_eq!(app.provider.sent().len(), 1);
}

#[tokio::test]
async fn test_rate_limiter_returns_retry_after() {
    let app = create_test_app_with(&[("security.rate_limit_per_minute", "2")]);
    let (_, token) = app.user();

    for _ in 0..2 {
        let response = app.send(get_request("/quota", &token)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.send(get_request("/quota", &token)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));

    // Limits are per user
    let (_, other_token) = app.user();
    let response = app.send(get_request("/quota", &other_token)).await;
    assert_eq!(response.status(), StatusCode::OK);
}
