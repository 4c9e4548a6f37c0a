//! Periodic reconciliation sweeps
//!
//! The scheduler owns one background task. Every `interval` it runs a sweep: a sync
//! of every known identity, fanned out up to the guard's concurrency limit and
//! bounded by a wall-clock ceiling. A sweep that times out is abandoned (the rest of
//! the identities are deferred to the next tick). A sweep that errors or panics puts
//! the scheduler into `ErrorBackoff` for a shorter cooldown before the next attempt.
//! Nothing a sweep does can end the loop; only `stop()` does.
//!
//! ```text
//! Stopped --start()--> Running --tick--> Sweeping --ok/timeout--> Running
//!                                            \--error/panic--> ErrorBackoff --cooldown--> Running
//! Running/Sweeping/ErrorBackoff --stop()--> Stopped
//! ```
//!
//! The cooldown replaces the interval: a scheduler back in Running after a cooldown
//! ticks straight into the retry sweep.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{BillingError, BillingResult};
use crate::sync::{SyncEngine, SyncOutcome, SyncTrigger};

/// Scheduler timing and fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_runtime: Duration,
    pub error_backoff: Duration,
    pub max_concurrency: usize,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_runtime: Duration::from_secs(600),
            error_backoff: Duration::from_secs(60),
            max_concurrency: 4,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    /// Read `RECONCILE_*` overrides on top of the defaults
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let config = Self {
            interval: env_secs("RECONCILE_INTERVAL_SECS", defaults.interval)?,
            max_runtime: env_secs("RECONCILE_MAX_RUNTIME_SECS", defaults.max_runtime)?,
            error_backoff: env_secs("RECONCILE_ERROR_BACKOFF_SECS", defaults.error_backoff)?,
            max_concurrency: env_parse("RECONCILE_MAX_CONCURRENCY", defaults.max_concurrency)?,
            shutdown_grace: env_secs("RECONCILE_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
        };

        if config.interval.is_zero() || config.max_runtime.is_zero() {
            return Err(BillingError::Config(
                "RECONCILE_INTERVAL_SECS and RECONCILE_MAX_RUNTIME_SECS must be positive"
                    .to_string(),
            ));
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{key} must be a non-negative integer"))),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> BillingResult<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
    Sweeping,
    ErrorBackoff,
}

/// Per-sweep counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub total: usize,
    pub synced: usize,
    pub no_subscription: usize,
    pub not_found: usize,
    pub failed: usize,
    /// Identities never attempted because the sweep was cut short
    pub deferred: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// `stop()` arrived mid-sweep
    Cancelled(SweepReport),
    TimedOut(SweepReport),
    Failed { error: String },
}

impl SweepOutcome {
    pub fn report(&self) -> Option<&SweepReport> {
        match self {
            SweepOutcome::Completed(r) | SweepOutcome::Cancelled(r) | SweepOutcome::TimedOut(r) => {
                Some(r)
            }
            SweepOutcome::Failed { .. } => None,
        }
    }
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub state: SchedulerState,
    pub interval_seconds: u64,
    pub max_runtime_seconds: u64,
    pub error_backoff_seconds: u64,
    pub max_concurrency: usize,
    pub completed_sweeps: usize,
    pub failed_sweeps: usize,
    pub last_outcome: Option<SweepOutcome>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sweep_at: Option<OffsetDateTime>,
}

/// Live counters, shared with the sweep so a timed-out sweep still reports progress
#[derive(Debug, Default)]
struct SweepProgress {
    total: AtomicUsize,
    synced: AtomicUsize,
    no_subscription: AtomicUsize,
    not_found: AtomicUsize,
    failed: AtomicUsize,
}

impl SweepProgress {
    fn record(&self, result: &BillingResult<SyncOutcome>) {
        let counter = match result {
            Ok(SyncOutcome::Synced(_)) => &self.synced,
            Ok(SyncOutcome::NoSubscription { .. }) => &self.no_subscription,
            Ok(SyncOutcome::CustomerNotFound) | Err(BillingError::IdentityNotFound(_)) => {
                &self.not_found
            }
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn report(&self, elapsed: Duration) -> SweepReport {
        let total = self.total.load(Ordering::SeqCst);
        let synced = self.synced.load(Ordering::SeqCst);
        let no_subscription = self.no_subscription.load(Ordering::SeqCst);
        let not_found = self.not_found.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        SweepReport {
            total,
            synced,
            no_subscription,
            not_found,
            failed,
            deferred: total.saturating_sub(synced + no_subscription + not_found + failed),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    state: SchedulerState,
    completed_sweeps: usize,
    failed_sweeps: usize,
    last_outcome: Option<SweepOutcome>,
    last_sweep_at: Option<OffsetDateTime>,
}

#[derive(Debug)]
struct Shared {
    status: RwLock<StatusInner>,
}

impl Shared {
    fn set_state(&self, state: SchedulerState) {
        self.status.write().unwrap_or_else(|e| e.into_inner()).state = state;
    }

    fn record(&self, outcome: SweepOutcome) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if matches!(outcome, SweepOutcome::Failed { .. }) {
            status.failed_sweeps += 1;
        } else {
            status.completed_sweeps += 1;
        }
        status.last_outcome = Some(outcome);
        status.last_sweep_at = Some(OffsetDateTime::now_utc());
    }
}

struct LoopHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct ReconciliationScheduler {
    engine: Arc<SyncEngine>,
    config: SchedulerConfig,
    shared: Arc<Shared>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl ReconciliationScheduler {
    pub fn new(engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shared: Arc::new(Shared {
                status: RwLock::new(StatusInner {
                    state: SchedulerState::Stopped,
                    completed_sweeps: 0,
                    failed_sweeps: 0,
                    last_outcome: None,
                    last_sweep_at: None,
                }),
            }),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawn the sweep loop. The first sweep runs one interval from now.
    pub async fn start(&self) {
        let mut loop_handle = self.loop_handle.lock().await;
        if loop_handle.is_some() {
            tracing::warn!("Reconciliation scheduler already started, ignoring duplicate start");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shared.set_state(SchedulerState::Running);

        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.engine),
            self.config.clone(),
            Arc::clone(&self.shared),
            shutdown_rx,
        ));

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            max_runtime_secs = self.config.max_runtime.as_secs(),
            max_concurrency = self.config.max_concurrency,
            "Reconciliation scheduler started"
        );

        *loop_handle = Some(LoopHandle {
            handle,
            shutdown_tx,
        });
    }

    /// Cancel the pending tick and signal any in-flight sweep to wind down.
    ///
    /// Waits up to the shutdown grace period, then aborts the loop. Safe to call
    /// repeatedly and before `start()`.
    pub async fn stop(&self) {
        let Some(LoopHandle {
            mut handle,
            shutdown_tx,
        }) = self.loop_handle.lock().await.take()
        else {
            tracing::debug!("Reconciliation scheduler not running, nothing to stop");
            return;
        };

        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(self.config.shutdown_grace, &mut handle).await {
            Ok(Ok(())) => tracing::info!("Reconciliation scheduler stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Reconciliation loop ended abnormally"),
            Err(_) => {
                tracing::warn!(
                    grace_secs = self.config.shutdown_grace.as_secs(),
                    "Reconciliation loop did not stop within grace period, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        self.shared.set_state(SchedulerState::Stopped);
    }

    pub async fn is_running(&self) -> bool {
        self.loop_handle.lock().await.is_some()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.is_running().await;
        let status = self.shared.status.read().unwrap_or_else(|e| e.into_inner());
        SchedulerStatus {
            running,
            state: status.state,
            interval_seconds: self.config.interval.as_secs(),
            max_runtime_seconds: self.config.max_runtime.as_secs(),
            error_backoff_seconds: self.config.error_backoff.as_secs(),
            max_concurrency: self.config.max_concurrency,
            completed_sweeps: status.completed_sweeps,
            failed_sweeps: status.failed_sweeps,
            last_outcome: status.last_outcome.clone(),
            last_sweep_at: status.last_sweep_at,
        }
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    config: SchedulerConfig,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut wait = config.interval;
    let mut backing_off = false;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown_rx.changed() => {
                // Sender gone means the scheduler itself was dropped
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }

        if backing_off {
            shared.set_state(SchedulerState::Running);
            tracing::info!("Error backoff elapsed, retrying reconciliation sweep");
        }

        shared.set_state(SchedulerState::Sweeping);
        let outcome = execute_sweep(&engine, &config, shutdown_rx.clone()).await;

        backing_off = matches!(outcome, SweepOutcome::Failed { .. });
        wait = match &outcome {
            SweepOutcome::Failed { .. } => {
                shared.set_state(SchedulerState::ErrorBackoff);
                config.error_backoff
            }
            _ => {
                shared.set_state(SchedulerState::Running);
                config.interval
            }
        };
        shared.record(outcome);
    }

    tracing::info!("Reconciliation loop exiting");
}

/// Run one sweep under the runtime ceiling, turning every way it can end into an outcome
pub(crate) async fn execute_sweep(
    engine: &Arc<SyncEngine>,
    config: &SchedulerConfig,
    cancel: watch::Receiver<bool>,
) -> SweepOutcome {
    let progress = Arc::new(SweepProgress::default());
    let started = Instant::now();

    tracing::info!("Starting reconciliation sweep");

    let sweep = AssertUnwindSafe(run_sweep(
        Arc::clone(engine),
        Arc::clone(&progress),
        cancel.clone(),
    ))
    .catch_unwind();

    let outcome = match tokio::time::timeout(config.max_runtime, sweep).await {
        Ok(Ok(Ok(()))) if *cancel.borrow() => {
            SweepOutcome::Cancelled(progress.report(started.elapsed()))
        }
        Ok(Ok(Ok(()))) => SweepOutcome::Completed(progress.report(started.elapsed())),
        Ok(Ok(Err(e))) => SweepOutcome::Failed {
            error: e.to_string(),
        },
        Ok(Err(panic)) => SweepOutcome::Failed {
            error: format!("sweep panicked: {}", panic_message(panic.as_ref())),
        },
        Err(_) => {
            let err = BillingError::SweepTimeout(config.max_runtime);
            tracing::warn!(error = %err, "Abandoning reconciliation sweep");
            SweepOutcome::TimedOut(progress.report(started.elapsed()))
        }
    };

    match &outcome {
        SweepOutcome::Failed { error } => {
            tracing::error!(error = %error, "Reconciliation sweep failed");
        }
        other => {
            if let Some(report) = other.report() {
                tracing::info!(
                    total = report.total,
                    synced = report.synced,
                    no_subscription = report.no_subscription,
                    not_found = report.not_found,
                    failed = report.failed,
                    deferred = report.deferred,
                    duration_ms = report.duration_ms,
                    "Reconciliation sweep finished"
                );
            }
        }
    }

    outcome
}

async fn run_sweep(
    engine: Arc<SyncEngine>,
    progress: Arc<SweepProgress>,
    mut cancel: watch::Receiver<bool>,
) -> BillingResult<()> {
    if !engine.is_configured() {
        return Err(BillingError::Config(
            "Stripe credentials are not configured".to_string(),
        ));
    }

    let identity_ids = engine.store().list_identity_ids().await?;
    progress.total.store(identity_ids.len(), Ordering::SeqCst);

    // Dropping the set (timeout or abort) aborts every sync still running in it
    let mut tasks = JoinSet::new();

    for identity_id in identity_ids {
        if *cancel.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = engine.guard().acquire_sweep_permit() => permit?,
            _ = cancel.changed() => break,
        };

        let engine = Arc::clone(&engine);
        let progress = Arc::clone(&progress);
        tasks.spawn(async move {
            let _permit = permit;
            let result = engine.sync(identity_id, SyncTrigger::Sweep).await;
            progress.record(&result);
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            // A panicking sync only costs its own identity
            if e.is_panic() {
                tracing::error!(error = %e, "Identity sync panicked during sweep");
                progress.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
