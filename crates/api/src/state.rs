//! Application state

use std::sync::Arc;

use billsync_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    /// Sync engine, webhook handler and the process-wide scheduler
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: BillingService) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            billing: Arc::new(billing),
        }
    }
}
