//! Postgres-backed [`BillingStore`]
//!
//! Every write is idempotent: subscriptions upsert on the provider id, transactions
//! insert with `ON CONFLICT DO NOTHING`, and webhook events are claimed with a single
//! `INSERT ... ON CONFLICT ... RETURNING` so only one worker wins.

use async_trait::async_trait;
use billsync_shared::{CanonicalStatus, PlanTier, SubscriptionStatus};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::health::HealthStatus;
use crate::store::{
    BillingStore, Identity, SubscriptionRecord, TransactionRecord, UpsertOutcome, WebhookClaim,
    WebhookResult, PROCESSING_TIMEOUT_MINUTES,
};

type IdentityRow = (Uuid, String, Option<String>, String, String);
type SubscriptionRow = (
    String,
    Uuid,
    String,
    String,
    OffsetDateTime,
    OffsetDateTime,
    OffsetDateTime,
);
type TransactionRow = (String, Uuid, i64, String, OffsetDateTime);

#[derive(Debug, Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn identity_from_row(row: IdentityRow) -> BillingResult<Identity> {
    let (id, email, stripe_customer_id, status, tier) = row;
    Ok(Identity {
        id,
        email,
        stripe_customer_id,
        subscription_status: status
            .parse::<CanonicalStatus>()
            .map_err(|e| BillingError::Internal(format!("users.subscription_status: {e}")))?,
        // Unknown tiers in legacy rows degrade to free rather than failing the read
        plan_tier: tier.parse::<PlanTier>().unwrap_or_default(),
    })
}

fn subscription_from_row(row: SubscriptionRow) -> BillingResult<SubscriptionRecord> {
    let (id, identity_id, status, tier, start, end, created) = row;
    Ok(SubscriptionRecord {
        stripe_subscription_id: id,
        identity_id,
        status: status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Internal(format!("subscriptions.status: {e}")))?,
        plan_tier: tier.parse::<PlanTier>().unwrap_or_default(),
        current_period_start: start,
        current_period_end: end,
        stripe_created_at: created,
    })
}

const IDENTITY_COLUMNS: &str =
    "id, email, stripe_customer_id, subscription_status, plan_tier";

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_identity(&self, identity_id: Uuid) -> BillingResult<Option<Identity>> {
        let row: Option<IdentityRow> =
            sqlx::query_as(&format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE id = $1"))
                .bind(identity_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(identity_from_row).transpose()
    }

    async fn find_identity_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<Identity>> {
        let row: Option<IdentityRow> = sqlx::query_as(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM users WHERE stripe_customer_id = $1 LIMIT 1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(identity_from_row).transpose()
    }

    async fn find_identity_by_email(&self, email: &str) -> BillingResult<Option<Identity>> {
        let row: Option<IdentityRow> = sqlx::query_as(&format!(
            "SELECT {IDENTITY_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1) \
             ORDER BY created_at ASC LIMIT 1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(identity_from_row).transpose()
    }

    async fn list_identity_ids(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn set_customer_id(&self, identity_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE users SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer_id)
        .bind(identity_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_subscription(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<UpsertOutcome> {
        // The WHERE on the conflict branch keeps a subscription pinned to its first owner.
        // xmax = 0 distinguishes a fresh insert from an update.
        let written: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (stripe_subscription_id, user_id, status, plan_tier,
                 current_period_start, current_period_end, stripe_created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                plan_tier = EXCLUDED.plan_tier,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                updated_at = NOW()
            WHERE subscriptions.user_id = EXCLUDED.user_id
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&record.stripe_subscription_id)
        .bind(record.identity_id)
        .bind(record.status.as_str())
        .bind(record.plan_tier.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.stripe_created_at)
        .fetch_optional(&self.pool)
        .await?;

        match written {
            Some((true,)) => Ok(UpsertOutcome::Inserted),
            Some((false,)) => Ok(UpsertOutcome::Updated),
            None => {
                let owner: Option<(Uuid,)> = sqlx::query_as(
                    "SELECT user_id FROM subscriptions WHERE stripe_subscription_id = $1",
                )
                .bind(&record.stripe_subscription_id)
                .fetch_optional(&self.pool)
                .await?;

                let (owner,) = owner.ok_or_else(|| {
                    BillingError::Internal(format!(
                        "subscription {} vanished during upsert",
                        record.stripe_subscription_id
                    ))
                })?;
                Ok(UpsertOutcome::OwnedByOther(owner))
            }
        }
    }

    async fn list_subscriptions(&self, identity_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT stripe_subscription_id, user_id, status, plan_tier,
                   current_period_start, current_period_end, stripe_created_at
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY stripe_created_at DESC
            "#,
        )
        .bind(identity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(subscription_from_row).collect()
    }

    async fn transaction_exists(&self, stripe_invoice_id: &str) -> BillingResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM transactions WHERE stripe_invoice_id = $1)",
        )
        .bind(stripe_invoice_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_transaction(&self, record: &TransactionRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transactions (stripe_invoice_id, user_id, amount_cents, currency, paid_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stripe_invoice_id) DO NOTHING
            "#,
        )
        .bind(&record.stripe_invoice_id)
        .bind(record.identity_id)
        .bind(record.amount_cents)
        .bind(&record.currency)
        .bind(record.paid_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_transactions(&self, identity_id: Uuid) -> BillingResult<Vec<TransactionRecord>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT stripe_invoice_id, user_id, amount_cents, currency, paid_at
            FROM transactions
            WHERE user_id = $1
            ORDER BY paid_at DESC
            "#,
        )
        .bind(identity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(stripe_invoice_id, identity_id, amount_cents, currency, paid_at)| {
                    TransactionRecord {
                        stripe_invoice_id,
                        identity_id,
                        amount_cents,
                        currency,
                        paid_at,
                    }
                },
            )
            .collect())
    }

    async fn update_identity_status(
        &self,
        identity_id: Uuid,
        status: CanonicalStatus,
        tier: PlanTier,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET subscription_status = $1, plan_tier = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(tier.as_str())
        .bind(identity_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::IdentityNotFound(identity_id));
        }

        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<WebhookClaim> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING stripe_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        Ok(if claimed.is_some() {
            WebhookClaim::Claimed
        } else {
            WebhookClaim::Duplicate
        })
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: &WebhookResult,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(result.error_message())
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_webhook_events(&self, days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stripe_webhook_events
            WHERE processing_result <> 'processing'
              AND created_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(days.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn health(&self) -> HealthStatus {
        match sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
        {
            Ok(_) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unavailable(e.to_string()),
        }
    }
}
