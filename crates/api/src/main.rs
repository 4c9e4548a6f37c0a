//! billsync API Server
//!
//! Owns the process-wide reconciliation scheduler: started once on boot, stopped on
//! shutdown signal after the HTTP server has drained.

use std::net::SocketAddr;

use billsync_api::{create_router, AppState, Config};
use billsync_billing::BillingService;
use billsync_shared::{create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Daily at 03:30 UTC
const WEBHOOK_RETENTION_CRON: &str = "0 30 3 * * *";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,billsync_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting billsync API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    run_migrations(&pool).await?;

    // Missing Stripe credentials are fatal unless billing is explicitly disabled
    let billing = if config.enable_billing {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");
        billing
    } else {
        tracing::warn!("Billing disabled via config (ENABLE_BILLING=false)");
        BillingService::unconfigured(pool.clone())
    };

    if config.admin_api_token.is_none() {
        tracing::warn!("ADMIN_API_TOKEN not set - admin routes will reject all requests");
    }

    let state = AppState::new(pool.clone(), config.clone(), billing);

    if state.billing.is_configured() {
        state.billing.scheduler.start().await;
    } else {
        tracing::info!("Reconciliation scheduler not started (billing unconfigured)");
    }

    let mut cron = start_retention_job(&state).await?;

    let app = create_router(state.clone())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, shutting down background work");
    state.billing.scheduler.stop().await;
    if let Err(e) = cron.shutdown().await {
        tracing::error!(error = ?e, "Failed to stop cron scheduler");
    }
    pool.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Schedule the daily prune of old processed webhook events
async fn start_retention_job(state: &AppState) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let store = state.billing.engine.store().clone();
    let retention_days = state.config.webhook_retention_days;
    scheduler
        .add(Job::new_async(WEBHOOK_RETENTION_CRON, move |_uuid, _l| {
            let store = store.clone();
            Box::pin(async move {
                match store.prune_webhook_events(retention_days).await {
                    Ok(pruned) => tracing::info!(
                        pruned = pruned,
                        retention_days = retention_days,
                        "Pruned processed webhook events"
                    ),
                    Err(e) => tracing::error!(error = %e, "Failed to prune webhook events"),
                }
            })
        })?)
        .await?;
    tracing::info!(
        retention_days = retention_days,
        "Scheduled: Webhook event retention (daily 03:30 UTC)"
    );

    scheduler.start().await?;
    Ok(scheduler)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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

    tracing::info!("Shutdown signal received");
}
