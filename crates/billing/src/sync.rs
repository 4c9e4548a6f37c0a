//! Subscription sync engine
//!
//! `sync` pulls the authoritative subscription and invoice state for one identity
//! from Stripe and writes it into the local store. It is the single place that
//! mutates an identity's `subscription_status`/`plan_tier`, and every trigger path
//! (webhook, sweep, admin) goes through it.
//!
//! Ordering within one sync:
//! 1. every provider read completes before the first local write, so a provider
//!    failure leaves local state untouched;
//! 2. subscriptions are upserted and paid invoices inserted-or-skipped;
//! 3. the identity's canonical status is written last.
//!
//! A sync interrupted after step 2 leaves the identity stale but never wrong in a
//! way the next sync cannot repair, since every step is idempotent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use billsync_shared::{CanonicalStatus, PlanTier, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult, ErrorKind};
use crate::guard::SyncGuard;
use crate::provider::{ProviderClient, ProviderCustomer, ProviderSubscription, UnconfiguredProvider};
use crate::store::{BillingStore, Identity, SubscriptionRecord, TransactionRecord, UpsertOutcome};

/// How many recent sync runs are kept in memory
pub const SYNC_RUN_LOG_CAPACITY: usize = 256;

/// What caused a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Webhook,
    Sweep,
    Admin,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncTrigger::Webhook => "webhook",
            SyncTrigger::Sweep => "sweep",
            SyncTrigger::Admin => "admin",
        })
    }
}

/// Counts from a sync that found subscriptions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub status: CanonicalStatus,
    pub plan_tier: PlanTier,
    pub subscriptions_inserted: usize,
    pub subscriptions_updated: usize,
    pub transactions_inserted: usize,
    pub ownership_conflicts: usize,
}

/// Successful result of a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced(SyncSummary),
    /// Customer exists but has no subscriptions; identity reset to none/free
    NoSubscription { transactions_inserted: usize },
    /// No Stripe customer for this identity; nothing was written
    CustomerNotFound,
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Synced(_) => "synced",
            SyncOutcome::NoSubscription { .. } => "no_subscription",
            SyncOutcome::CustomerNotFound => "customer_not_found",
        }
    }
}

/// Outcome recorded on a [`SyncRun`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncRunOutcome {
    Synced { status: CanonicalStatus, plan_tier: PlanTier },
    NoSubscription,
    CustomerNotFound,
    Failed { kind: ErrorKind, retryable: bool, error: String },
}

impl From<&BillingResult<SyncOutcome>> for SyncRunOutcome {
    fn from(result: &BillingResult<SyncOutcome>) -> Self {
        match result {
            Ok(SyncOutcome::Synced(summary)) => SyncRunOutcome::Synced {
                status: summary.status,
                plan_tier: summary.plan_tier,
            },
            Ok(SyncOutcome::NoSubscription { .. }) => SyncRunOutcome::NoSubscription,
            Ok(SyncOutcome::CustomerNotFound) => SyncRunOutcome::CustomerNotFound,
            Err(e) => SyncRunOutcome::Failed {
                kind: e.kind(),
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
        }
    }
}

/// One sync invocation, kept for observability
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub identity_id: Uuid,
    pub trigger: SyncTrigger,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: SyncRunOutcome,
}

/// Bounded in-memory ring of recent sync runs
#[derive(Debug)]
pub struct SyncRunLog {
    runs: Mutex<VecDeque<SyncRun>>,
    capacity: usize,
}

impl SyncRunLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, run: SyncRun) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.len() >= self.capacity {
            runs.pop_front();
        }
        runs.push_back(run);
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<SyncRun> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent first
    pub fn for_identity(&self, identity_id: Uuid) -> Vec<SyncRun> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.iter()
            .rev()
            .filter(|run| run.identity_id == identity_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyncRunLog {
    fn default() -> Self {
        Self::new(SYNC_RUN_LOG_CAPACITY)
    }
}

/// The fields of a subscription that the canonical-status rule looks at
pub trait CanonicalCandidate {
    fn status(&self) -> SubscriptionStatus;
    fn plan_tier(&self) -> PlanTier;
    fn created(&self) -> OffsetDateTime;
}

impl CanonicalCandidate for ProviderSubscription {
    fn status(&self) -> SubscriptionStatus {
        self.status
    }

    fn plan_tier(&self) -> PlanTier {
        self.plan_tier
    }

    fn created(&self) -> OffsetDateTime {
        self.created
    }
}

impl CanonicalCandidate for SubscriptionRecord {
    fn status(&self) -> SubscriptionStatus {
        self.status
    }

    fn plan_tier(&self) -> PlanTier {
        self.plan_tier
    }

    fn created(&self) -> OffsetDateTime {
        self.stripe_created_at
    }
}

/// Pick the subscription that determines an identity's status.
///
/// Highest canonical priority wins; ties go to the most recently created.
/// The tier only carries over while the winning status still grants access.
pub fn resolve_canonical<'a, I, C>(subscriptions: I) -> (CanonicalStatus, PlanTier)
where
    I: IntoIterator<Item = &'a C>,
    C: CanonicalCandidate + 'a,
{
    let winner = subscriptions.into_iter().max_by(|a, b| {
        a.status()
            .canonical()
            .cmp(&b.status().canonical())
            .then_with(|| a.created().cmp(&b.created()))
    });

    match winner {
        Some(sub) => {
            let status = sub.status().canonical();
            let tier = if status.grants_access() {
                sub.plan_tier()
            } else {
                PlanTier::Free
            };
            (status, tier)
        }
        None => (CanonicalStatus::None, PlanTier::Free),
    }
}

pub struct SyncEngine {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn ProviderClient>,
    guard: SyncGuard<SyncOutcome>,
    runs: SyncRunLog,
    configured: bool,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn ProviderClient>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            provider,
            guard: SyncGuard::new(max_concurrency),
            runs: SyncRunLog::default(),
            configured: true,
        }
    }

    /// Engine without provider credentials. Every sync fails with a configuration error.
    pub fn unconfigured(store: Arc<dyn BillingStore>) -> Self {
        Self {
            configured: false,
            ..Self::new(store, Arc::new(UnconfiguredProvider), 1)
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    pub fn guard(&self) -> &SyncGuard<SyncOutcome> {
        &self.guard
    }

    pub fn runs(&self) -> &SyncRunLog {
        &self.runs
    }

    /// Reconcile one identity with Stripe.
    ///
    /// Concurrent calls for the same identity share one run. Errors carry their
    /// retryability via [`BillingError::is_retryable`].
    #[tracing::instrument(skip_all, fields(identity_id = %identity_id, trigger = %trigger))]
    pub async fn sync(&self, identity_id: Uuid, trigger: SyncTrigger) -> BillingResult<SyncOutcome> {
        let started_at = OffsetDateTime::now_utc();
        let started = Instant::now();

        let result = if self.configured {
            self.guard
                .run(identity_id, || self.sync_identity(identity_id))
                .await
        } else {
            Err(BillingError::Config(
                "Stripe credentials are not configured".to_string(),
            ))
        };

        let run = SyncRun {
            identity_id,
            trigger,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome: SyncRunOutcome::from(&result),
        };

        match &result {
            Ok(outcome) => tracing::info!(
                outcome = outcome.label(),
                duration_ms = run.duration_ms,
                "Subscription sync completed"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                retryable = e.is_retryable(),
                duration_ms = run.duration_ms,
                "Subscription sync failed"
            ),
        }

        self.runs.push(run);
        result
    }

    async fn sync_identity(&self, identity_id: Uuid) -> BillingResult<SyncOutcome> {
        let identity = self
            .store
            .get_identity(identity_id)
            .await?
            .ok_or(BillingError::IdentityNotFound(identity_id))?;

        // Provider reads
        let Some(customer) = self.resolve_customer(&identity).await? else {
            tracing::info!(email = %identity.email, "No Stripe customer for identity");
            return Ok(SyncOutcome::CustomerNotFound);
        };
        let mut subscriptions = self.provider.list_subscriptions(&customer.id).await?;
        let invoices = self.provider.list_paid_invoices(&customer.id).await?;

        // Records under a replaced customer still belong to this identity
        let previous_customer = identity
            .stripe_customer_id
            .as_deref()
            .filter(|previous| *previous != customer.id);
        if let Some(previous) = previous_customer {
            subscriptions.extend(self.previous_customer_subscriptions(previous).await?);
        }

        // Local writes
        if identity.stripe_customer_id.as_deref() != Some(customer.id.as_str()) {
            self.store.set_customer_id(identity_id, &customer.id).await?;
            tracing::info!(customer_id = %customer.id, "Linked Stripe customer to identity");
        }

        let mut summary = SyncSummary::default();

        for sub in &subscriptions {
            let record = SubscriptionRecord {
                stripe_subscription_id: sub.id.clone(),
                identity_id,
                status: sub.status,
                plan_tier: sub.plan_tier,
                current_period_start: sub.current_period_start,
                current_period_end: sub.current_period_end,
                stripe_created_at: sub.created,
            };

            match self.store.upsert_subscription(&record).await? {
                UpsertOutcome::Inserted => summary.subscriptions_inserted += 1,
                UpsertOutcome::Updated => summary.subscriptions_updated += 1,
                UpsertOutcome::OwnedByOther(owner) => {
                    summary.ownership_conflicts += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        owner_id = %owner,
                        "Subscription already belongs to another identity, leaving it untouched"
                    );
                }
            }
        }

        for invoice in &invoices {
            if self.store.transaction_exists(&invoice.id).await? {
                continue;
            }

            let inserted = self
                .store
                .insert_transaction(&TransactionRecord {
                    stripe_invoice_id: invoice.id.clone(),
                    identity_id,
                    amount_cents: invoice.amount_paid_cents,
                    currency: invoice.currency.clone(),
                    paid_at: invoice.paid_at,
                })
                .await?;

            if inserted {
                summary.transactions_inserted += 1;
                tracing::debug!(
                    invoice_id = %invoice.id,
                    amount_cents = invoice.amount_paid_cents,
                    "Recorded paid invoice"
                );
            }
        }

        let owned = self.store.list_subscriptions(identity_id).await?;
        let (status, tier) = resolve_canonical(&owned);
        self.store
            .update_identity_status(identity_id, status, tier)
            .await?;

        if identity.subscription_status != status || identity.plan_tier != tier {
            tracing::info!(
                from_status = %identity.subscription_status,
                to_status = %status,
                from_tier = %identity.plan_tier,
                to_tier = %tier,
                "Identity subscription state changed"
            );
        }

        if subscriptions.is_empty() && owned.is_empty() {
            return Ok(SyncOutcome::NoSubscription {
                transactions_inserted: summary.transactions_inserted,
            });
        }

        summary.status = status;
        summary.plan_tier = tier;
        Ok(SyncOutcome::Synced(summary))
    }

    /// Final state of subscriptions under a customer the identity was relinked away from.
    ///
    /// A customer Stripe refuses to list for anymore contributes nothing; the
    /// stored records keep their last known state.
    async fn previous_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        match self.provider.list_subscriptions(customer_id).await {
            Ok(subscriptions) => Ok(subscriptions),
            Err(e) if !e.is_retryable() => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Could not list subscriptions of previous Stripe customer"
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Stored customer id first; fall back to email when absent or deleted upstream
    async fn resolve_customer(&self, identity: &Identity) -> BillingResult<Option<ProviderCustomer>> {
        if let Some(customer_id) = identity.stripe_customer_id.as_deref() {
            if let Some(customer) = self.provider.retrieve_customer(customer_id).await? {
                return Ok(Some(customer));
            }
            tracing::warn!(
                customer_id = %customer_id,
                "Stored Stripe customer no longer exists, falling back to email lookup"
            );
        }

        self.provider.find_customer_by_email(&identity.email).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use billsync_shared::SubscriptionStatus;
    use time::Duration;

    fn sub(id: &str, status: SubscriptionStatus, tier: PlanTier, age_days: i64) -> ProviderSubscription {
        let created = OffsetDateTime::UNIX_EPOCH + Duration::days(1000 - age_days);
        ProviderSubscription {
            id: id.to_string(),
            customer_id: "cus_1".to_string(),
            status,
            plan_tier: tier,
            current_period_start: created,
            current_period_end: created + Duration::days(30),
            created,
        }
    }

    // =========================================================================
    // Priority resolution
    // =========================================================================

    #[test]
    fn test_active_beats_canceled_and_past_due() {
        let subs = [
            sub("sub_c", SubscriptionStatus::Canceled, PlanTier::Team, 1),
            sub("sub_a", SubscriptionStatus::Active, PlanTier::Pro, 5),
            sub("sub_p", SubscriptionStatus::PastDue, PlanTier::Starter, 3),
        ];
        assert_eq!(
            resolve_canonical(&subs),
            (CanonicalStatus::Active, PlanTier::Pro)
        );
    }

    #[test]
    fn test_tie_broken_by_most_recent_creation() {
        let subs = [
            sub("sub_old", SubscriptionStatus::Active, PlanTier::Starter, 40),
            sub("sub_new", SubscriptionStatus::Active, PlanTier::Team, 2),
        ];
        assert_eq!(resolve_canonical(&subs).1, PlanTier::Team);
    }

    #[test]
    fn test_canceled_only_drops_to_free() {
        let subs = [sub("sub_c", SubscriptionStatus::Canceled, PlanTier::Pro, 1)];
        assert_eq!(
            resolve_canonical(&subs),
            (CanonicalStatus::Canceled, PlanTier::Free)
        );
    }

    #[test]
    fn test_unpaid_keeps_tier_as_past_due() {
        let subs = [sub("sub_u", SubscriptionStatus::Unpaid, PlanTier::Pro, 1)];
        assert_eq!(
            resolve_canonical(&subs),
            (CanonicalStatus::PastDue, PlanTier::Pro)
        );
    }

    #[test]
    fn test_empty_resolves_to_none() {
        assert_eq!(
            resolve_canonical(&Vec::<ProviderSubscription>::new()),
            (CanonicalStatus::None, PlanTier::Free)
        );
    }

    // =========================================================================
    // Run log
    // =========================================================================

    fn run(identity_id: Uuid) -> SyncRun {
        let now = OffsetDateTime::now_utc();
        SyncRun {
            identity_id,
            trigger: SyncTrigger::Sweep,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            outcome: SyncRunOutcome::NoSubscription,
        }
    }

    #[test]
    fn test_run_log_is_bounded() {
        let log = SyncRunLog::new(3);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            log.push(run(*id));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent[0].identity_id, ids[4]);
        assert_eq!(recent[2].identity_id, ids[2]);
        assert!(log.for_identity(ids[0]).is_empty());
    }

    #[test]
    fn test_failed_run_serializes_kind() {
        let result: BillingResult<SyncOutcome> = Err(BillingError::ProviderUnavailable {
            message: "rate limited".into(),
            rate_limited: true,
        });
        let value = serde_json::to_value(SyncRunOutcome::from(&result)).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["kind"], "transient_provider");
        assert_eq!(value["retryable"], true);
    }
}
