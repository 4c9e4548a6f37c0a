//! Admin billing routes
//!
//! All routes here sit behind [`require_admin_token`].

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use billsync_billing::{
    sync::SYNC_RUN_LOG_CAPACITY, InvariantCheckSummary, InvariantChecker, SchedulerStatus,
    SyncOutcome, SyncRun, SyncTrigger,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_RUN_LIMIT: usize = 50;

// =============================================================================
// Authentication
// =============================================================================

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
}

/// Reject requests without the configured admin bearer token
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.admin_api_token.as_deref() else {
        tracing::warn!("Admin request rejected: ADMIN_API_TOKEN is not set");
        return Err(ApiError::Unauthorized);
    };

    let provided = extract_bearer_token(&request).ok_or(ApiError::Unauthorized)?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "Admin request with invalid token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

// =============================================================================
// Manual sync
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run a sync for one identity and wait for it
pub async fn sync_identity(
    State(state): State<AppState>,
    identity_id: Result<Path<Uuid>, PathRejection>,
) -> Response {
    let identity_id = match identity_id {
        Ok(Path(identity_id)) => identity_id,
        Err(rejection) => return ApiError::BadRequest(rejection.body_text()).into_response(),
    };

    tracing::info!(identity_id = %identity_id, "Admin triggered subscription sync");

    match state
        .billing
        .engine
        .sync(identity_id, SyncTrigger::Admin)
        .await
    {
        Ok(outcome) => Json(SyncResponse {
            success: true,
            retryable: false,
            outcome: Some(outcome),
            error: None,
        })
        .into_response(),
        Err(e) => {
            let retryable = e.is_retryable();
            let message = e.to_string();
            let status = ApiError::from(e).status();
            let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
                "An unexpected error occurred".to_string()
            } else {
                message
            };
            (
                status,
                Json(SyncResponse {
                    success: false,
                    retryable,
                    outcome: None,
                    error: Some(error),
                }),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Observability
// =============================================================================

pub async fn reconciler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.billing.scheduler.status().await)
}

#[derive(Debug, Deserialize)]
pub struct SyncRunsQuery {
    pub limit: Option<usize>,
    pub identity_id: Option<Uuid>,
}

/// Most recent sync runs, newest first
pub async fn recent_sync_runs(
    State(state): State<AppState>,
    query: Result<Query<SyncRunsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<SyncRun>>> {
    let Query(query) = query.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let runs = state.billing.engine.runs();
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .min(SYNC_RUN_LOG_CAPACITY);

    let selected = match query.identity_id {
        Some(identity_id) => runs.for_identity(identity_id).into_iter().take(limit).collect(),
        None => runs.recent(limit),
    };
    Ok(Json(selected))
}

/// Run the read-only billing consistency checks
pub async fn check_billing_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = InvariantChecker::new(state.pool.clone())
        .run_all_checks()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to run invariant checks");
            ApiError::from(e)
        })?;

    Ok(Json(summary))
}
