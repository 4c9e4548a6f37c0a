//! API error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use billsync_billing::{BillingError, ErrorKind};
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Billing is not configured: {0}")]
    NotConfigured(String),

    #[error("Upstream temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match (&e, e.kind()) {
            (BillingError::Database(msg), _) => ApiError::Database(msg.clone()),
            (_, ErrorKind::Configuration) => ApiError::NotConfigured(e.to_string()),
            (_, ErrorKind::Authentication) => ApiError::InvalidSignature,
            (_, ErrorKind::NotFound) => ApiError::NotFound(e.to_string()),
            (_, ErrorKind::TransientProvider | ErrorKind::Timeout) => {
                ApiError::Unavailable(e.to_string())
            }
            (_, ErrorKind::Unexpected) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidSignature | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotConfigured(_) | ApiError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            ApiError::Unauthorized => ("unauthorized", "Missing or invalid admin token".to_string()),
            ApiError::InvalidSignature => ("invalid_signature", self.to_string()),
            ApiError::BadRequest(msg) => ("bad_request", msg.clone()),
            ApiError::NotFound(msg) => ("not_found", msg.clone()),
            ApiError::NotConfigured(msg) => {
                tracing::warn!(error = %msg, "Billing request while unconfigured");
                ("not_configured", self.to_string())
            }
            ApiError::Unavailable(msg) => ("unavailable", msg.clone()),
            ApiError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                ("internal_error", "An unexpected error occurred".to_string())
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ("internal_error", "An unexpected error occurred".to_string())
            }
        };

        (
            self.status(),
            Json(ErrorResponse {
                error: code,
                message,
            }),
        )
            .into_response()
    }
}
