//! Billing Invariants Module
//!
//! Read-only consistency checks over the local billing tables. They can be run after
//! a sweep or a webhook replay to confirm the store converged.
//!
//! A sync in flight can briefly violate `identity_status_matches_records` (status is
//! written last), so a single violation right after heavy webhook traffic is not
//! conclusive. Re-run before acting on it.

use billsync_shared::CanonicalStatus;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Identities affected
    pub identity_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money recorded against the wrong (or no) identity
    Critical,
    /// Access state disagrees with billing records
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Canonical status name for a priority rank produced by the SQL below
fn status_for_priority(priority: i32) -> &'static str {
    match priority {
        4 => "active",
        3 => "trialing",
        2 => "past_due",
        1 => "canceled",
        _ => "none",
    }
}

/// SQL list of the statuses that grant access
fn access_status_sql_list() -> String {
    CanonicalStatus::ALL
        .iter()
        .filter(|status| status.grants_access())
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Row type for status mismatch violation
#[derive(Debug, sqlx::FromRow)]
struct StatusMismatchRow {
    identity_id: Uuid,
    subscription_status: String,
    expected_priority: i32,
}

/// Row type for access without customer violation
#[derive(Debug, sqlx::FromRow)]
struct AccessWithoutCustomerRow {
    identity_id: Uuid,
    email: String,
    subscription_status: String,
    plan_tier: String,
}

/// Row type for paid tier without access violation
#[derive(Debug, sqlx::FromRow)]
struct TierWithoutAccessRow {
    identity_id: Uuid,
    subscription_status: String,
    plan_tier: String,
}

const CHECKS: &[&str] = &[
    "identity_status_matches_records",
    "access_status_has_customer",
    "non_access_status_is_free",
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_identity_status_matches_records().await?);
        violations.extend(self.check_access_status_has_customer().await?);
        violations.extend(self.check_non_access_status_is_free().await?);

        let summary = InvariantCheckSummary::from_violations(CHECKS.len(), violations);
        if !summary.healthy {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }

    /// Identity status equals the highest-priority status among its subscriptions
    async fn check_identity_status_matches_records(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusMismatchRow> = sqlx::query_as(
            r#"
            WITH ranked AS (
                SELECT user_id,
                       MAX(CASE status
                           WHEN 'active' THEN 4
                           WHEN 'trialing' THEN 3
                           WHEN 'past_due' THEN 2
                           WHEN 'unpaid' THEN 2
                           WHEN 'canceled' THEN 1
                           WHEN 'incomplete_expired' THEN 1
                           WHEN 'paused' THEN 1
                           ELSE 0
                       END) AS priority
                FROM subscriptions
                GROUP BY user_id
            )
            SELECT u.id AS identity_id,
                   u.subscription_status,
                   COALESCE(r.priority, 0)::INT4 AS expected_priority
            FROM users u
            LEFT JOIN ranked r ON r.user_id = u.id
            WHERE CASE u.subscription_status
                      WHEN 'active' THEN 4
                      WHEN 'trialing' THEN 3
                      WHEN 'past_due' THEN 2
                      WHEN 'canceled' THEN 1
                      ELSE 0
                  END <> COALESCE(r.priority, 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let expected = status_for_priority(row.expected_priority);
                InvariantViolation {
                    invariant: "identity_status_matches_records".to_string(),
                    identity_ids: vec![row.identity_id],
                    description: format!(
                        "Identity status is '{}' but its subscriptions resolve to '{}'",
                        row.subscription_status, expected
                    ),
                    context: serde_json::json!({
                        "stored_status": row.subscription_status,
                        "expected_status": expected,
                    }),
                    severity: ViolationSeverity::High,
                }
            })
            .collect())
    }

    /// Identities with an access-granting status were resolved to a Stripe customer
    async fn check_access_status_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AccessWithoutCustomerRow> = sqlx::query_as(&format!(
            r#"
            SELECT id AS identity_id, email, subscription_status, plan_tier
            FROM users
            WHERE subscription_status IN ({})
              AND stripe_customer_id IS NULL
            "#,
            access_status_sql_list()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "access_status_has_customer".to_string(),
                identity_ids: vec![row.identity_id],
                description: format!(
                    "Identity '{}' is '{}' on tier '{}' with no Stripe customer",
                    row.email, row.subscription_status, row.plan_tier
                ),
                context: serde_json::json!({
                    "email": row.email,
                    "subscription_status": row.subscription_status,
                    "plan_tier": row.plan_tier,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Identities without access hold no paid tier
    async fn check_non_access_status_is_free(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierWithoutAccessRow> = sqlx::query_as(&format!(
            r#"
            SELECT id AS identity_id, subscription_status, plan_tier
            FROM users
            WHERE subscription_status NOT IN ({})
              AND plan_tier <> 'free'
            "#,
            access_status_sql_list()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_access_status_is_free".to_string(),
                identity_ids: vec![row.identity_id],
                description: format!(
                    "Identity is '{}' but still on paid tier '{}'",
                    row.subscription_status, row.plan_tier
                ),
                context: serde_json::json!({
                    "subscription_status": row.subscription_status,
                    "plan_tier": row.plan_tier,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "identity_status_matches_records" => {
                self.check_identity_status_matches_records().await
            }
            "access_status_has_customer" => self.check_access_status_has_customer().await,
            "non_access_status_is_free" => self.check_non_access_status_is_free().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}
