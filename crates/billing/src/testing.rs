//! In-memory store and scriptable provider for tests.
//!
//! Enabled for this crate's own tests and, through the `testing` feature, for
//! downstream crates that exercise the HTTP layer without Postgres or Stripe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use billsync_shared::{CanonicalStatus, PlanTier, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::health::HealthStatus;
use crate::provider::{ProviderClient, ProviderCustomer, ProviderInvoice, ProviderSubscription};
use crate::store::{
    BillingStore, Identity, SubscriptionRecord, TransactionRecord, UpsertOutcome, WebhookClaim,
    WebhookResult, PROCESSING_TIMEOUT_MINUTES,
};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Store
// =============================================================================

/// Stored webhook event row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEventRow {
    pub event_type: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub processing_started_at: OffsetDateTime,
}

#[derive(Default)]
struct MemoryState {
    identities: HashMap<Uuid, Identity>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    transactions: HashMap<String, TransactionRecord>,
    webhook_events: HashMap<String, WebhookEventRow>,
}

/// [`BillingStore`] over plain hash maps, with failure injection
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    fail_next_status_write: AtomicBool,
    fail_webhook_claims: AtomicBool,
    fail_next_identity_lookup: AtomicBool,
    panic_on_identity_listing: AtomicBool,
    status_writes: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity as if it signed up
    pub fn add_identity(&self, identity: Identity) {
        write(&self.state).identities.insert(identity.id, identity);
    }

    /// Seed a subscription row directly, bypassing the sync engine
    pub fn add_subscription(&self, record: SubscriptionRecord) {
        write(&self.state)
            .subscriptions
            .insert(record.stripe_subscription_id.clone(), record);
    }

    pub fn identity(&self, identity_id: Uuid) -> Option<Identity> {
        read(&self.state).identities.get(&identity_id).cloned()
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<SubscriptionRecord> {
        read(&self.state).subscriptions.get(subscription_id).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        read(&self.state).transactions.len()
    }

    pub fn webhook_event(&self, event_id: &str) -> Option<WebhookEventRow> {
        read(&self.state).webhook_events.get(event_id).cloned()
    }

    /// Backdate a webhook event, for retention and stale-claim tests
    pub fn age_webhook_event(&self, event_id: &str, by: time::Duration) {
        if let Some(row) = write(&self.state).webhook_events.get_mut(event_id) {
            row.created_at -= by;
            row.processing_started_at -= by;
        }
    }

    /// Make the next identity lookup by customer id or email fail
    pub fn fail_next_identity_lookup(&self) {
        self.fail_next_identity_lookup.store(true, Ordering::SeqCst);
    }

    /// Panic inside `list_identity_ids` while set, to blow up a whole sweep
    pub fn panic_on_identity_listing(&self, panic: bool) {
        self.panic_on_identity_listing.store(panic, Ordering::SeqCst);
    }

    fn check_identity_lookup(&self) -> BillingResult<()> {
        if self.fail_next_identity_lookup.swap(false, Ordering::SeqCst) {
            return Err(BillingError::Database("connection reset by peer".to_string()));
        }
        Ok(())
    }

    /// Make the next identity status write fail (simulates a crash mid-sync)
    pub fn fail_next_status_write(&self) {
        self.fail_next_status_write.store(true, Ordering::SeqCst);
    }

    /// Make every webhook claim fail as if the database were down
    pub fn fail_webhook_claims(&self, fail: bool) {
        self.fail_webhook_claims.store(fail, Ordering::SeqCst);
    }

    /// Number of successful identity status writes
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get_identity(&self, identity_id: Uuid) -> BillingResult<Option<Identity>> {
        Ok(self.identity(identity_id))
    }

    async fn find_identity_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<Identity>> {
        self.check_identity_lookup()?;
        Ok(read(&self.state)
            .identities
            .values()
            .find(|i| i.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn find_identity_by_email(&self, email: &str) -> BillingResult<Option<Identity>> {
        self.check_identity_lookup()?;
        Ok(read(&self.state)
            .identities
            .values()
            .find(|i| i.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list_identity_ids(&self) -> BillingResult<Vec<Uuid>> {
        if self.panic_on_identity_listing.load(Ordering::SeqCst) {
            panic!("identity listing blew up");
        }
        let mut ids: Vec<Uuid> = read(&self.state).identities.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn set_customer_id(&self, identity_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let mut state = write(&self.state);
        let identity = state
            .identities
            .get_mut(&identity_id)
            .ok_or(BillingError::IdentityNotFound(identity_id))?;
        identity.stripe_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<UpsertOutcome> {
        let mut state = write(&self.state);
        match state.subscriptions.get_mut(&record.stripe_subscription_id) {
            Some(existing) if existing.identity_id != record.identity_id => {
                Ok(UpsertOutcome::OwnedByOther(existing.identity_id))
            }
            Some(existing) => {
                existing.status = record.status;
                existing.plan_tier = record.plan_tier;
                existing.current_period_start = record.current_period_start;
                existing.current_period_end = record.current_period_end;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state
                    .subscriptions
                    .insert(record.stripe_subscription_id.clone(), record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn list_subscriptions(&self, identity_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>> {
        let mut subs: Vec<SubscriptionRecord> = read(&self.state)
            .subscriptions
            .values()
            .filter(|s| s.identity_id == identity_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.stripe_created_at.cmp(&a.stripe_created_at));
        Ok(subs)
    }

    async fn transaction_exists(&self, stripe_invoice_id: &str) -> BillingResult<bool> {
        Ok(read(&self.state).transactions.contains_key(stripe_invoice_id))
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> BillingResult<bool> {
        let mut state = write(&self.state);
        if state.transactions.contains_key(&record.stripe_invoice_id) {
            return Ok(false);
        }
        state
            .transactions
            .insert(record.stripe_invoice_id.clone(), record.clone());
        Ok(true)
    }

    async fn list_transactions(&self, identity_id: Uuid) -> BillingResult<Vec<TransactionRecord>> {
        let mut txs: Vec<TransactionRecord> = read(&self.state)
            .transactions
            .values()
            .filter(|t| t.identity_id == identity_id)
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.paid_at.cmp(&a.paid_at));
        Ok(txs)
    }

    async fn update_identity_status(
        &self,
        identity_id: Uuid,
        status: CanonicalStatus,
        tier: PlanTier,
    ) -> BillingResult<()> {
        if self.fail_next_status_write.swap(false, Ordering::SeqCst) {
            return Err(BillingError::Database("connection reset by peer".to_string()));
        }

        let mut state = write(&self.state);
        let identity = state
            .identities
            .get_mut(&identity_id)
            .ok_or(BillingError::IdentityNotFound(identity_id))?;
        identity.subscription_status = status;
        identity.plan_tier = tier;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        _event_timestamp: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        if self.fail_webhook_claims.load(Ordering::SeqCst) {
            return Err(BillingError::Database("connection refused".to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let stale_before = now - time::Duration::minutes(i64::from(PROCESSING_TIMEOUT_MINUTES));

        let mut state = write(&self.state);
        if let Some(row) = state.webhook_events.get_mut(event_id) {
            if row.processing_result == "processing" && row.processing_started_at < stale_before {
                row.processing_started_at = now;
                row.error_message = Some(format!("Recovered from stuck state at {now}"));
                return Ok(WebhookClaim::Claimed);
            }
            return Ok(WebhookClaim::Duplicate);
        }
        state.webhook_events.insert(
            event_id.to_string(),
            WebhookEventRow {
                event_type: event_type.to_string(),
                processing_result: "processing".to_string(),
                error_message: None,
                created_at: now,
                processing_started_at: now,
            },
        );
        Ok(WebhookClaim::Claimed)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &WebhookResult,
    ) -> BillingResult<()> {
        if let Some(row) = write(&self.state).webhook_events.get_mut(event_id) {
            row.processing_result = result.as_str().to_string();
            row.error_message = result.error_message().map(str::to_string);
        }
        Ok(())
    }

    async fn prune_webhook_events(&self, days: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(days);
        let mut state = write(&self.state);
        let before = state.webhook_events.len();
        state
            .webhook_events
            .retain(|_, row| row.processing_result == "processing" || row.created_at >= cutoff);
        Ok((before - state.webhook_events.len()) as u64)
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

// =============================================================================
// Provider
// =============================================================================

#[derive(Default)]
struct ProviderState {
    customers: HashMap<String, ProviderCustomer>,
    subscriptions: HashMap<String, Vec<ProviderSubscription>>,
    invoices: HashMap<String, Vec<ProviderInvoice>>,
}

/// Scriptable [`ProviderClient`] that counts calls and can simulate outages
#[derive(Default)]
pub struct MockProvider {
    state: RwLock<ProviderState>,
    rate_limited: AtomicBool,
    delay: RwLock<Option<Duration>>,
    panic_customer: RwLock<Option<String>>,
    list_calls: AtomicUsize,
    active_fetches: AtomicUsize,
    peak_fetches: AtomicUsize,
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_customer(&self, id: &str, email: &str) {
        write(&self.state).customers.insert(
            id.to_string(),
            ProviderCustomer {
                id: id.to_string(),
                email: Some(email.to_string()),
            },
        );
    }

    pub fn remove_customer(&self, id: &str) {
        write(&self.state).customers.remove(id);
    }

    /// Add or replace a subscription (matched by id)
    pub fn set_subscription(&self, subscription: ProviderSubscription) {
        let mut state = write(&self.state);
        let subs = state
            .subscriptions
            .entry(subscription.customer_id.clone())
            .or_default();
        subs.retain(|s| s.id != subscription.id);
        subs.push(subscription);
    }

    pub fn add_paid_invoice(&self, invoice: ProviderInvoice) {
        write(&self.state)
            .invoices
            .entry(invoice.customer_id.clone())
            .or_default()
            .push(invoice);
    }

    /// Every call fails with a 429 while set
    pub fn set_rate_limited(&self, rate_limited: bool) {
        self.rate_limited.store(rate_limited, Ordering::SeqCst);
    }

    /// Delay each subscription listing, to widen race windows
    pub fn set_delay(&self, delay: Option<Duration>) {
        *write(&self.delay) = delay;
    }

    /// Panic while listing subscriptions for this customer
    pub fn panic_on_customer(&self, customer_id: Option<&str>) {
        *write(&self.panic_customer) = customer_id.map(str::to_string);
    }

    /// Number of `list_subscriptions` calls so far
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Most `list_subscriptions` calls ever in flight at once
    pub fn peak_concurrent_fetches(&self) -> usize {
        self.peak_fetches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderUnavailable {
                message: "Too many requests".to_string(),
                rate_limited: true,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Option<ProviderCustomer>> {
        self.check_available()?;
        Ok(read(&self.state).customers.get(customer_id).cloned())
    }

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<ProviderCustomer>> {
        self.check_available()?;
        Ok(read(&self.state)
            .customers
            .values()
            .find(|c| {
                c.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let panics = read(&self.panic_customer).as_deref() == Some(customer_id);
        if panics {
            panic!("subscription listing for {customer_id} blew up");
        }

        let now = self.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_fetches.fetch_max(now, Ordering::SeqCst);

        let delay = *read(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let subs = read(&self.state)
            .subscriptions
            .get(customer_id)
            .cloned()
            .unwrap_or_default();
        self.active_fetches.fetch_sub(1, Ordering::SeqCst);
        Ok(subs)
    }

    async fn list_paid_invoices(&self, customer_id: &str) -> BillingResult<Vec<ProviderInvoice>> {
        self.check_available()?;
        Ok(read(&self.state)
            .invoices
            .get(customer_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn health(&self) -> HealthStatus {
        if self.rate_limited.load(Ordering::SeqCst) {
            HealthStatus::Degraded("rate limited".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// A subscription for `customer_id` created `created_unix` seconds after the epoch
pub fn subscription(
    id: &str,
    customer_id: &str,
    status: SubscriptionStatus,
    plan_tier: PlanTier,
    created_unix: i64,
) -> ProviderSubscription {
    let created =
        OffsetDateTime::from_unix_timestamp(created_unix).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    ProviderSubscription {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        status,
        plan_tier,
        current_period_start: created,
        current_period_end: created + time::Duration::days(30),
        created,
    }
}

pub fn paid_invoice(id: &str, customer_id: &str, amount_cents: i64) -> ProviderInvoice {
    ProviderInvoice {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        amount_paid_cents: amount_cents,
        currency: "usd".to_string(),
        paid_at: OffsetDateTime::now_utc(),
    }
}
