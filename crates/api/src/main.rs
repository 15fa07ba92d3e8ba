use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use domain::services::{MessagingProvider, MockMessagingProvider, SystemClock};
use gateway_api::app::{create_app, AppState};
use gateway_api::config::{Config, ProviderKind};
use gateway_api::jobs::{DueBroadcastJob, JobScheduler, PoolMetricsJob, QrExpiryJob};
use gateway_api::middleware::{init_metrics, logging::init_logging};
use gateway_api::services::{Collaborators, CoreServices, HttpMessagingProvider};
use persistence::repositories::{
    BroadcastRepository, ContactRepository, DeviceRepository, PgPlanRepository, QuotaRepository,
};
use shared::jwt::TokenVerifier;

const JOB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load()?;
    init_logging(&config.logging);

    info!("Starting session gateway v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
    }

    let pool = persistence::db::create_pool(&(&config.database).into()).await?;
    info!("Running database migrations...");
    persistence::db::run_migrations(&pool).await?;
    info!("Migrations completed");

    let (provider_tx, provider_rx) = mpsc::channel(config.events.channel_capacity.max(1));
    let provider: Arc<dyn MessagingProvider> = match config.provider.kind {
        ProviderKind::Mock => {
            warn!("Using the mock messaging provider; no message leaves this process");
            Arc::new(MockMessagingProvider::with_auto_qr(provider_tx.clone()))
        }
        ProviderKind::Http => Arc::new(HttpMessagingProvider::new(&config.provider)?),
    };

    let collaborators = Collaborators {
        devices: Arc::new(DeviceRepository::new(pool.clone())),
        broadcasts: Arc::new(BroadcastRepository::new(pool.clone())),
        quotas: Arc::new(QuotaRepository::new(pool.clone())),
        contacts: Arc::new(ContactRepository::new(pool.clone())),
        plans: Arc::new(PgPlanRepository::new(pool.clone())),
        provider,
        clock: Arc::new(SystemClock),
    };
    let services = CoreServices::build(collaborators, &config)?;

    // No provider handle survives a restart
    let reset = services.sessions.reset_live_sessions().await?;
    let restored = services.broadcasts.restore().await?;
    info!(reset_devices = reset, restored_broadcasts = restored, "Recovered state");

    let event_pump = services.sessions.spawn_event_pump(provider_rx);

    let mut scheduler = JobScheduler::new();
    scheduler.register(DueBroadcastJob::new(
        services.broadcasts.clone(),
        config.broadcasts.due_poll_secs,
    ));
    scheduler.register(QrExpiryJob::new(
        services.sessions.clone(),
        config.sessions.qr_sweep_secs,
    ));
    scheduler.register(PoolMetricsJob::new(pool.clone()));
    scheduler.start();

    let verifier = TokenVerifier::from_rsa_pem(&config.jwt.public_key, config.jwt.leeway_secs)?;
    let addr = config.socket_addr()?;
    let state = AppState::new(config, services, verifier, provider_tx, Some(pool));
    let app = create_app(state);

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    scheduler.wait_for_shutdown(JOB_SHUTDOWN_TIMEOUT).await;
    event_pump.abort();
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
