//! Stripe client wrapper and configuration
//!
//! Implements [`ProviderClient`] on top of async-stripe. List calls page manually with
//! `starting_after` so every subscription and invoice is returned, and each request is
//! retried a few times on rate limits and network errors before surfacing as
//! [`BillingError::ProviderUnavailable`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use billsync_shared::{PlanTier, SubscriptionStatus};
use stripe::{
    Customer, CustomerId, Expandable, Invoice, InvoiceId, InvoiceStatus, ListCustomers,
    ListInvoices, ListSubscriptions, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, SubscriptionStatusFilter,
};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::health::HealthStatus;
use crate::provider::{ProviderClient, ProviderCustomer, ProviderInvoice, ProviderSubscription};

/// Stripe list page size (Stripe's maximum)
const PAGE_SIZE: u64 = 100;

/// Retries per request after the first attempt
const MAX_RETRIES: usize = 3;

/// Stripe price ids per plan tier. Several prices may map to one tier
/// (monthly and annual, legacy prices).
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub starter: Vec<String>,
    pub pro: Vec<String>,
    pub team: Vec<String>,
    pub enterprise: Vec<String>,
}

impl PriceIds {
    fn from_env() -> Self {
        Self {
            starter: env_list("STRIPE_PRICE_STARTER"),
            pro: env_list("STRIPE_PRICE_PRO"),
            team: env_list("STRIPE_PRICE_TEAM"),
            enterprise: env_list("STRIPE_PRICE_ENTERPRISE"),
        }
    }
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    /// Load configuration from `STRIPE_*` environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = required_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = required_env("STRIPE_WEBHOOK_SECRET")?;

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids: PriceIds::from_env(),
        })
    }

    /// Map a Stripe price id to the plan tier it sells
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<PlanTier> {
        let matches = |ids: &[String]| ids.iter().any(|id| id == price_id);

        if matches(&self.price_ids.starter) {
            Some(PlanTier::Starter)
        } else if matches(&self.price_ids.pro) {
            Some(PlanTier::Pro)
        } else if matches(&self.price_ids.team) {
            Some(PlanTier::Team)
        } else if matches(&self.price_ids.enterprise) {
            Some(PlanTier::Enterprise)
        } else {
            None
        }
    }
}

fn required_env(key: &str) -> BillingResult<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{key} must be set"))),
    }
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Run a Stripe request, retrying transient failures with jittered backoff
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut request: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(125)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(MAX_RETRIES);

        RetryIf::spawn(
            strategy,
            || {
                let fut = request();
                async move { fut.await.map_err(BillingError::from) }
            },
            |e: &BillingError| {
                let retry = matches!(e, BillingError::ProviderUnavailable { .. });
                if retry {
                    tracing::warn!(operation, error = %e, "Transient Stripe error, retrying");
                }
                retry
            },
        )
        .await
    }

    fn to_provider_subscription(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<ProviderSubscription> {
        let id = subscription.id.to_string();
        let plan_tier = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| self.config.tier_for_price_id(price.id.as_str()))
            .unwrap_or_default();

        Ok(ProviderSubscription {
            customer_id: expandable_customer_id(&subscription.customer),
            status: map_subscription_status(&subscription.status),
            plan_tier,
            current_period_start: from_unix(
                subscription.current_period_start,
                "current_period_start",
                &id,
            )?,
            current_period_end: from_unix(
                subscription.current_period_end,
                "current_period_end",
                &id,
            )?,
            created: from_unix(subscription.created, "created", &id)?,
            id,
        })
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient").finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderClient for StripeClient {
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Option<ProviderCustomer>> {
        let id = parse_customer_id(customer_id)?;

        let customer = self
            .with_retry("retrieve_customer", || {
                let fut = Customer::retrieve(&self.inner, &id, &[]);
                async move {
                    match fut.await {
                        Ok(customer) => Ok(Some(customer)),
                        Err(stripe::StripeError::Stripe(req)) if req.http_status == 404 => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;

        Ok(customer
            .filter(|customer| !customer.deleted)
            .map(|customer| ProviderCustomer {
                id: customer.id.to_string(),
                email: customer.email,
            }))
    }

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<ProviderCustomer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = self
            .with_retry("find_customer_by_email", || {
                Customer::list(&self.inner, &params)
            })
            .await?;

        Ok(customers
            .data
            .into_iter()
            .find(|customer| !customer.deleted)
            .map(|customer| ProviderCustomer {
                id: customer.id.to_string(),
                email: customer.email,
            }))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let customer = parse_customer_id(customer_id)?;
        let mut starting_after: Option<SubscriptionId> = None;
        let mut subscriptions = Vec::new();

        loop {
            let mut params = ListSubscriptions::new();
            params.customer = Some(customer.clone());
            params.status = Some(SubscriptionStatusFilter::All);
            params.limit = Some(PAGE_SIZE);
            params.starting_after = starting_after.clone();

            let page = self
                .with_retry("list_subscriptions", || {
                    Subscription::list(&self.inner, &params)
                })
                .await?;

            starting_after = page.data.last().map(|s| s.id.clone());
            for subscription in &page.data {
                subscriptions.push(self.to_provider_subscription(subscription)?);
            }

            if !page.has_more || starting_after.is_none() {
                break;
            }
        }

        tracing::debug!(
            customer_id = %customer_id,
            count = subscriptions.len(),
            "Fetched Stripe subscriptions"
        );

        Ok(subscriptions)
    }

    async fn list_paid_invoices(&self, customer_id: &str) -> BillingResult<Vec<ProviderInvoice>> {
        let customer = parse_customer_id(customer_id)?;
        let mut starting_after: Option<InvoiceId> = None;
        let mut invoices = Vec::new();

        loop {
            let mut params = ListInvoices::new();
            params.customer = Some(customer.clone());
            params.status = Some(InvoiceStatus::Paid);
            params.limit = Some(PAGE_SIZE);
            params.starting_after = starting_after.clone();

            let page = self
                .with_retry("list_paid_invoices", || Invoice::list(&self.inner, &params))
                .await?;

            starting_after = page.data.last().map(|i| i.id.clone());
            for invoice in &page.data {
                invoices.push(to_provider_invoice(invoice, customer_id)?);
            }

            if !page.has_more || starting_after.is_none() {
                break;
            }
        }

        tracing::debug!(
            customer_id = %customer_id,
            count = invoices.len(),
            "Fetched paid Stripe invoices"
        );

        Ok(invoices)
    }

    async fn health(&self) -> HealthStatus {
        let mut params = ListCustomers::new();
        params.limit = Some(1);

        match Customer::list(&self.inner, &params).await.map_err(BillingError::from) {
            Ok(_) => HealthStatus::Healthy,
            Err(BillingError::ProviderUnavailable {
                rate_limited: true, ..
            }) => HealthStatus::Degraded("rate limited".to_string()),
            Err(e) => HealthStatus::Unavailable(e.to_string()),
        }
    }
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
}

fn expandable_customer_id(customer: &Expandable<Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(c) => c.id.to_string(),
    }
}

fn to_provider_invoice(invoice: &Invoice, customer_id: &str) -> BillingResult<ProviderInvoice> {
    let id = invoice.id.to_string();
    let paid_at = invoice_paid_at(
        &id,
        invoice.status_transitions.as_ref().and_then(|t| t.paid_at),
        invoice.created,
    )?;

    Ok(ProviderInvoice {
        customer_id: invoice
            .customer
            .as_ref()
            .map(expandable_customer_id)
            .unwrap_or_else(|| customer_id.to_string()),
        amount_paid_cents: invoice.amount_paid.unwrap_or(0),
        currency: invoice
            .currency
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "usd".to_string()),
        paid_at,
        id,
    })
}

/// Ledger timestamp for a paid invoice: the payment time, else its creation time
fn invoice_paid_at(
    invoice_id: &str,
    paid_at: Option<i64>,
    created: Option<i64>,
) -> BillingResult<OffsetDateTime> {
    let timestamp = paid_at.or(created).ok_or_else(|| {
        tracing::error!(invoice_id = %invoice_id, "Paid invoice has no payment timestamp");
        BillingError::StripeApi(format!("invoice {invoice_id} has no payment timestamp"))
    })?;
    from_unix(timestamp, "paid_at", invoice_id)
}

fn map_subscription_status(status: &StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

fn from_unix(ts: i64, field: &'static str, object_id: &str) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|e| {
        tracing::error!(
            object_id = %object_id,
            field,
            timestamp = ts,
            "Stripe returned an out-of-range timestamp"
        );
        BillingError::StripeApi(format!("{object_id}: invalid {field} timestamp {ts}: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                starter: vec!["price_starter_monthly".to_string()],
                pro: vec![
                    "price_pro_monthly".to_string(),
                    "price_pro_annual".to_string(),
                ],
                team: vec!["price_team_monthly".to_string()],
                enterprise: vec![],
            },
        }
    }

    #[test]
    fn test_tier_for_price_id() {
        let config = config();
        assert_eq!(
            config.tier_for_price_id("price_pro_annual"),
            Some(PlanTier::Pro)
        );
        assert_eq!(
            config.tier_for_price_id("price_team_monthly"),
            Some(PlanTier::Team)
        );
        assert_eq!(config.tier_for_price_id("price_unknown"), None);
    }

    #[test]
    fn test_status_mapping_covers_paused() {
        assert_eq!(
            map_subscription_status(&StripeSubStatus::Paused),
            SubscriptionStatus::Paused
        );
        assert_eq!(
            map_subscription_status(&StripeSubStatus::Unpaid),
            SubscriptionStatus::Unpaid
        );
    }

    #[test]
    fn test_invalid_customer_id_rejected() {
        assert!(parse_customer_id("cus_123").is_ok());
        assert!(matches!(
            parse_customer_id("not-a-customer"),
            Err(BillingError::StripeApi(_))
        ));
    }

    #[test]
    fn test_from_unix() {
        assert_eq!(
            from_unix(0, "created", "sub_1").unwrap(),
            OffsetDateTime::UNIX_EPOCH
        );
        assert!(matches!(
            from_unix(i64::MAX, "created", "sub_1"),
            Err(BillingError::StripeApi(_))
        ));
    }

    #[test]
    fn test_invoice_paid_at_never_invents_a_time() {
        assert_eq!(
            invoice_paid_at("in_1", Some(1_700_000_000), Some(1)).unwrap(),
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
        );
        assert_eq!(
            invoice_paid_at("in_1", None, Some(1)).unwrap(),
            OffsetDateTime::from_unix_timestamp(1).unwrap()
        );
        assert!(matches!(
            invoice_paid_at("in_1", None, None),
            Err(BillingError::StripeApi(_))
        ));
        assert!(matches!(
            invoice_paid_at("in_1", Some(i64::MAX), None),
            Err(BillingError::StripeApi(_))
        ));
    }
}
