//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use billsync_billing::WebhookOutcome;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify, deduplicate and dispatch one Stripe delivery.
///
/// Every accepted outcome is a 200 so Stripe stops retrying; the sync itself runs
/// detached. A bad signature is a 400 and a dedup store outage a 500, both of which
/// Stripe retries.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request missing Stripe-Signature header");
            ApiError::InvalidSignature
        })?;

    let handled = state
        .billing
        .webhooks
        .handle(&body, signature)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, kind = ?e.kind(), "Webhook rejected");
            ApiError::from(e)
        })?;

    Ok(Json(handled.outcome))
}
