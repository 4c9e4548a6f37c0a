//! Provider capability interface
//!
//! The sync engine only talks to the payment provider through [`ProviderClient`].
//! The Stripe-backed implementation lives in [`crate::client`].

use async_trait::async_trait;
use billsync_shared::{PlanTier, SubscriptionStatus};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::health::HealthStatus;

/// Customer as known to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
}

/// Authoritative subscription state fetched from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub plan_tier: PlanTier,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub created: OffsetDateTime,
}

/// A paid invoice fetched from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInvoice {
    pub id: String,
    pub customer_id: String,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub paid_at: OffsetDateTime,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Look up a customer by id. Deleted or unknown customers return `None`.
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Option<ProviderCustomer>>;

    /// Look up a customer by email (most recent match wins)
    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<ProviderCustomer>>;

    /// All subscriptions for a customer, in any status, across every page
    async fn list_subscriptions(&self, customer_id: &str)
        -> BillingResult<Vec<ProviderSubscription>>;

    /// All paid invoices for a customer, across every page
    async fn list_paid_invoices(&self, customer_id: &str) -> BillingResult<Vec<ProviderInvoice>>;

    async fn health(&self) -> HealthStatus;
}

/// Stand-in used when billing is disabled: every call reports a configuration error
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredProvider;

impl UnconfiguredProvider {
    fn error() -> BillingError {
        BillingError::Config("Stripe credentials are not configured".to_string())
    }
}

#[async_trait]
impl ProviderClient for UnconfiguredProvider {
    async fn retrieve_customer(&self, _customer_id: &str) -> BillingResult<Option<ProviderCustomer>> {
        Err(Self::error())
    }

    async fn find_customer_by_email(&self, _email: &str) -> BillingResult<Option<ProviderCustomer>> {
        Err(Self::error())
    }

    async fn list_subscriptions(
        &self,
        _customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        Err(Self::error())
    }

    async fn list_paid_invoices(&self, _customer_id: &str) -> BillingResult<Vec<ProviderInvoice>> {
        Err(Self::error())
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Unconfigured
    }
}
