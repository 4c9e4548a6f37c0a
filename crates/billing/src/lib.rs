// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! billsync Billing Module
//!
//! Keeps local subscription state consistent with Stripe, which is the source of truth.
//!
//! ## Components
//!
//! - **Webhooks**: verify Stripe signatures, deduplicate by event id, dispatch syncs
//! - **Sync Engine**: re-fetch one identity's subscriptions and paid invoices and upsert them
//! - **Guard**: one sync per identity at a time, bounded sweep fan-out
//! - **Scheduler**: periodic sweeps with a runtime ceiling and error backoff
//! - **Invariants**: read-only consistency checks over the billing tables

pub mod client;
pub mod error;
pub mod guard;
pub mod health;
pub mod invariants;
pub mod pg_store;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Guard
pub use guard::SyncGuard;

// Health
pub use health::HealthStatus;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Provider
pub use provider::{
    ProviderClient, ProviderCustomer, ProviderInvoice, ProviderSubscription, UnconfiguredProvider,
};

// Scheduler
pub use scheduler::{
    ReconciliationScheduler, SchedulerConfig, SchedulerState, SchedulerStatus, SweepOutcome,
    SweepReport,
};

// Store
pub use pg_store::PgBillingStore;
pub use store::{
    BillingStore, Identity, SubscriptionRecord, TransactionRecord, UpsertOutcome, WebhookClaim,
    WebhookResult,
};

// Sync
pub use sync::{
    SyncEngine, SyncOutcome, SyncRun, SyncRunLog, SyncRunOutcome, SyncSummary, SyncTrigger,
};

// Webhooks
pub use webhooks::{HandledWebhook, WebhookEvent, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that wires the sync engine, webhook handler, and scheduler
/// around one shared store and provider
pub struct BillingService {
    pub engine: Arc<SyncEngine>,
    pub webhooks: WebhookHandler,
    pub scheduler: Arc<ReconciliationScheduler>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeConfig::from_env()?;
        let scheduler = SchedulerConfig::from_env()?;
        Ok(Self::new(stripe, scheduler, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(stripe: StripeConfig, scheduler: SchedulerConfig, pool: PgPool) -> Self {
        let webhook_secret = stripe.webhook_secret.clone();
        Self::with_components(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(StripeClient::new(stripe)),
            webhook_secret,
            scheduler,
        )
    }

    /// Billing disabled: syncs and webhooks fail with a configuration error and the
    /// scheduler has nothing to do
    pub fn unconfigured(pool: PgPool) -> Self {
        let engine = Arc::new(SyncEngine::unconfigured(Arc::new(PgBillingStore::new(pool))));
        Self {
            webhooks: WebhookHandler::unconfigured(Arc::clone(&engine)),
            scheduler: Arc::new(ReconciliationScheduler::new(
                Arc::clone(&engine),
                SchedulerConfig::default(),
            )),
            engine,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.engine.is_configured()
    }

    /// Assemble from explicit collaborators (tests use the in-memory store and mock provider)
    pub fn with_components(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn ProviderClient>,
        webhook_secret: impl Into<String>,
        scheduler: SchedulerConfig,
    ) -> Self {
        let engine = Arc::new(SyncEngine::new(store, provider, scheduler.max_concurrency));
        Self {
            webhooks: WebhookHandler::new(Arc::clone(&engine), webhook_secret),
            scheduler: Arc::new(ReconciliationScheduler::new(Arc::clone(&engine), scheduler)),
            engine,
        }
    }
}
