//! Local billing store interface
//!
//! [`BillingStore`] is everything the sync engine and the webhook dispatcher need from
//! persistence. [`crate::pg_store::PgBillingStore`] backs it with Postgres; the
//! `testing` feature adds an in-memory implementation.

use async_trait::async_trait;
use billsync_shared::{CanonicalStatus, PlanTier, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::health::HealthStatus;

/// Internal user record carrying the billing fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub subscription_status: CanonicalStatus,
    pub plan_tier: PlanTier,
}

impl Identity {
    /// A freshly signed-up identity with no billing state
    pub fn new(id: Uuid, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            stripe_customer_id: None,
            subscription_status: CanonicalStatus::None,
            plan_tier: PlanTier::Free,
        }
    }
}

/// Local mirror of a provider subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub stripe_subscription_id: String,
    pub identity_id: Uuid,
    pub status: SubscriptionStatus,
    pub plan_tier: PlanTier,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub stripe_created_at: OffsetDateTime,
}

/// Append-only ledger entry for a paid invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub stripe_invoice_id: String,
    pub identity_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_at: OffsetDateTime,
}

/// Result of upserting a subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The subscription id already belongs to another identity; nothing was written
    OwnedByOther(Uuid),
}

/// Minutes after which a `processing` claim is considered abandoned
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Result of trying to claim a webhook event id for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// This caller holds exclusive processing rights
    Claimed,
    /// Already processed, or being processed elsewhere
    Duplicate,
}

/// Final state recorded against a claimed webhook event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResult {
    Success,
    Ignored,
    Error(String),
}

impl WebhookResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookResult::Success => "success",
            WebhookResult::Ignored => "ignored",
            WebhookResult::Error(_) => "error",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            WebhookResult::Error(message) => Some(message),
            _ => None,
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_identity(&self, identity_id: Uuid) -> BillingResult<Option<Identity>>;

    async fn find_identity_by_customer(&self, customer_id: &str)
        -> BillingResult<Option<Identity>>;

    /// Case-insensitive email match
    async fn find_identity_by_email(&self, email: &str) -> BillingResult<Option<Identity>>;

    /// Every identity the sweep should visit
    async fn list_identity_ids(&self) -> BillingResult<Vec<Uuid>>;

    async fn set_customer_id(&self, identity_id: Uuid, customer_id: &str) -> BillingResult<()>;

    /// Insert a new subscription or update status/tier/period of an existing one.
    /// Never reassigns a subscription owned by another identity.
    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<UpsertOutcome>;

    async fn list_subscriptions(&self, identity_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>>;

    async fn transaction_exists(&self, stripe_invoice_id: &str) -> BillingResult<bool>;

    /// Insert-or-skip. Returns `true` when a new row was written.
    async fn insert_transaction(&self, record: &TransactionRecord) -> BillingResult<bool>;

    async fn list_transactions(&self, identity_id: Uuid) -> BillingResult<Vec<TransactionRecord>>;

    async fn update_identity_status(
        &self,
        identity_id: Uuid,
        status: CanonicalStatus,
        tier: PlanTier,
    ) -> BillingResult<()>;

    /// Atomically claim an event id. Claims stuck in `processing` past the recovery
    /// window may be taken over.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<WebhookClaim>;

    async fn finish_webhook_event(&self, event_id: &str, result: &WebhookResult)
        -> BillingResult<()>;

    /// Delete finished webhook events older than `days`. Returns rows removed.
    async fn prune_webhook_events(&self, days: i64) -> BillingResult<u64>;

    async fn health(&self) -> HealthStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_identity_is_unbilled() {
        let identity = Identity::new(Uuid::new_v4(), "a@example.com");
        assert_eq!(identity.subscription_status, CanonicalStatus::None);
        assert_eq!(identity.plan_tier, PlanTier::Free);
        assert!(identity.stripe_customer_id.is_none());
    }

    #[test]
    fn test_webhook_result_strings() {
        assert_eq!(WebhookResult::Success.as_str(), "success");
        let err = WebhookResult::Error("boom".into());
        assert_eq!(err.as_str(), "error");
        assert_eq!(err.error_message(), Some("boom"));
        assert_eq!(WebhookResult::Ignored.error_message(), None);
    }
}
