//! Liveness and dependency health

use axum::{extract::State, http::StatusCode, Json};
use billsync_billing::{HealthStatus, SchedulerState};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub billing_configured: bool,
    pub store: HealthStatus,
    pub provider: HealthStatus,
    pub scheduler: SchedulerState,
}

/// 503 only when the store is down; a degraded or unconfigured provider is reported
/// but the process can still take webhooks.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let engine = &state.billing.engine;
    let store = engine.store().health().await;
    let provider = engine.provider().health().await;
    let scheduler = state.billing.scheduler.status().await.state;

    let code = if store.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = if store.is_healthy() && provider.is_healthy() {
        "ok"
    } else {
        "degraded"
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            billing_configured: state.billing.is_configured(),
            store,
            provider,
            scheduler,
        }),
    )
}
