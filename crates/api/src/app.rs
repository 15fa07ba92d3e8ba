use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use domain::services::ProviderEvent;
use shared::jwt::TokenVerifier;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::middleware::{
    metrics_handler, metrics_middleware, quota_gate, rate_limit_middleware, require_user_auth,
    trace_id, RateLimiterState,
};
use crate::routes::{broadcasts, devices, events, health, provider_callbacks, quota};
use crate::services::CoreServices;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub services: CoreServices,
    pub verifier: Arc<TokenVerifier>,
    pub rate_limiter: Option<Arc<RateLimiterState>>,
    /// Feeds verified provider callbacks into the session event pump.
    pub provider_events: mpsc::Sender<ProviderEvent>,
    /// `None` when running on in-memory stores.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        config: Config,
        services: CoreServices,
        verifier: TokenVerifier,
        provider_events: mpsc::Sender<ProviderEvent>,
        pool: Option<PgPool>,
    ) -> Self {
        let rate_limiter =
            RateLimiterState::new(config.security.rate_limit_per_minute).map(Arc::new);

        Self {
            config: Arc::new(config),
            services,
            verifier: Arc::new(verifier),
            rate_limiter,
            provider_events,
            pool,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let config = state.config.clone();

    let cors = if config.security.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .security
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // Each gated call consumes one `api_requests` unit after auth
    let gate = || middleware::from_fn_with_state(state.clone(), quota_gate);

    // Middleware order: auth runs first, then rate limiting, then the quota gate
    let protected_routes = Router::new()
        .route(
            "/devices",
            get(devices::list_devices).post(devices::register_device),
        )
        .route("/devices/:device_id", delete(devices::delete_device))
        .route(
            "/devices/:device_id/connect",
            post(devices::connect_device).route_layer(gate()),
        )
        .route(
            "/devices/:device_id/reconnect",
            post(devices::reconnect_device).route_layer(gate()),
        )
        .route(
            "/devices/:device_id/disconnect",
            post(devices::disconnect_device),
        )
        .route("/devices/:device_id/qr", get(devices::get_qr))
        .route("/devices/:device_id/status", get(devices::get_status))
        .route(
            "/devices/:device_id/messages",
            post(devices::send_message).route_layer(gate()),
        )
        .route(
            "/broadcasts",
            post(broadcasts::create_broadcast)
                .route_layer(gate())
                .get(broadcasts::list_broadcasts),
        )
        .route("/broadcasts/:broadcast_id", get(broadcasts::get_broadcast))
        .route(
            "/broadcasts/:broadcast_id/cancel",
            delete(broadcasts::cancel_broadcast),
        )
        .route(
            "/broadcasts/:broadcast_id/recipients",
            get(broadcasts::list_recipients),
        )
        .route("/quota", get(quota::get_usage))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_user_auth,
        ));

    // Authenticated by query token and by body signature respectively
    let stream_routes = Router::new()
        .route("/events", get(events::subscribe))
        .route(
            "/internal/provider/events",
            post(provider_callbacks::receive_event),
        );

    let public_routes = Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/health/live", get(health::live))
        .route("/metrics", get(metrics_handler));

    Router::new()
        .merge(public_routes)
        .merge(stream_routes)
        .merge(protected_routes)
        // Global middleware (order matters: bottom layers run first)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.request_timeout_secs,
        )))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_id))
        .layer(cors)
        .with_state(state)
}
