//! Billing error types

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse error classification used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid provider credentials
    Configuration,
    /// Bad webhook signature or admin token
    Authentication,
    /// Identity or customer does not exist
    NotFound,
    /// Network failure, provider auth hiccup, or rate limit
    TransientProvider,
    /// Sweep exceeded its runtime ceiling
    Timeout,
    /// Anything else
    Unexpected,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BillingError {
    #[error("Billing configuration error: {0}")]
    Config(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Identity not found: {0}")]
    IdentityNotFound(Uuid),

    #[error("Stripe customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Stripe temporarily unavailable: {message}")]
    ProviderUnavailable { message: String, rate_limited: bool },

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Sync for identity {0} was abandoned before completing")]
    SyncAbandoned(Uuid),

    #[error("Reconciliation sweep exceeded its runtime ceiling of {0:?}")]
    SweepTimeout(Duration),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::Config(_) => ErrorKind::Configuration,
            BillingError::WebhookSignatureInvalid => ErrorKind::Authentication,
            BillingError::IdentityNotFound(_) | BillingError::CustomerNotFound(_) => {
                ErrorKind::NotFound
            }
            BillingError::ProviderUnavailable { .. } | BillingError::SyncAbandoned(_) => {
                ErrorKind::TransientProvider
            }
            BillingError::SweepTimeout(_) => ErrorKind::Timeout,
            BillingError::StripeApi(_) | BillingError::Database(_) | BillingError::Internal(_) => {
                ErrorKind::Unexpected
            }
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ProviderUnavailable { .. }
                | BillingError::SyncAbandoned(_)
                | BillingError::SweepTimeout(_)
                | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match &e {
            stripe::StripeError::Stripe(req) => match req.http_status {
                // 401 is usually a rotated key mid-deploy; keep it retryable
                401 | 409 | 429 => BillingError::ProviderUnavailable {
                    message: e.to_string(),
                    rate_limited: req.http_status == 429,
                },
                status if status >= 500 => BillingError::ProviderUnavailable {
                    message: e.to_string(),
                    rate_limited: false,
                },
                _ => BillingError::StripeApi(e.to_string()),
            },
            stripe::StripeError::ClientError(_) | stripe::StripeError::Timeout => {
                BillingError::ProviderUnavailable {
                    message: e.to_string(),
                    rate_limited: false,
                }
            }
            _ => BillingError::StripeApi(e.to_string()),
        }
    }
}
