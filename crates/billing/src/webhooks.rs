//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, deduplicates deliveries by event id and
//! hands relevant subscription/invoice events to the sync engine. The payload is only
//! used to find *which* identity to sync; the state itself is always re-fetched
//! from Stripe.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{WebhookClaim, WebhookResult};
use crate::sync::{SyncEngine, SyncOutcome, SyncTrigger};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed timestamp, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Event types that can change subscription or payment state
const RELEVANT_EVENT_TYPES: &[&str] = &[
    "customer.subscription.created",
    "customer.subscription.updated",
    "customer.subscription.deleted",
    "customer.subscription.paused",
    "customer.subscription.resumed",
    "customer.subscription.trial_will_end",
    "invoice.paid",
    "invoice.payment_succeeded",
    "invoice.payment_failed",
    "invoice.finalized",
    "checkout.session.completed",
];

pub fn is_relevant_event(event_type: &str) -> bool {
    RELEVANT_EVENT_TYPES.contains(&event_type)
}

/// The parts of a Stripe event envelope this crate reads
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// How to find the local identity an event refers to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerReference {
    pub customer_id: Option<String>,
    pub email: Option<String>,
}

impl WebhookEvent {
    /// Customer id (string or expanded object) with an embedded email as fallback
    pub fn customer_reference(&self) -> CustomerReference {
        let object = &self.data.object;

        let customer_id = match object.get("customer") {
            Some(serde_json::Value::String(id)) => Some(id.clone()),
            Some(serde_json::Value::Object(customer)) => customer
                .get("id")
                .and_then(|id| id.as_str())
                .map(str::to_string),
            _ => None,
        };

        let email = object
            .get("customer_email")
            .and_then(|v| v.as_str())
            .or_else(|| {
                object
                    .get("customer_details")
                    .and_then(|d| d.get("email"))
                    .and_then(|v| v.as_str())
            })
            .or_else(|| object.get("email").and_then(|v| v.as_str()))
            .filter(|e| !e.is_empty())
            .map(str::to_string);

        CustomerReference { customer_id, email }
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

/// What happened to an inbound webhook. All variants are acknowledged with 200.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// A sync was started for this identity
    Dispatched { identity_id: Uuid },
    /// Event id already claimed
    Duplicate,
    /// Event type has no bearing on subscription state
    Ignored { event_type: String },
    /// No local identity matches the event's customer
    UnknownCustomer,
}

/// Result of [`WebhookHandler::handle`]. Dropping `sync_task` detaches the sync.
#[derive(Debug)]
pub struct HandledWebhook {
    pub outcome: WebhookOutcome,
    pub sync_task: Option<JoinHandle<BillingResult<SyncOutcome>>>,
}

/// Verify a `Stripe-Signature` header against the raw payload.
///
/// Header format: `t=<unix>,v1=<hex>[,v1=<hex>][,v0=<hex>]`. Any `v1` may match.
pub fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signatures: Vec<&str> = Vec::new();

    for part in signature.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => v1_signatures.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if v1_signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let diff = (now_unix - timestamp).abs();
    if diff > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            diff = diff,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    let matched = v1_signatures
        .iter()
        .any(|candidate| bool::from(computed.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    engine: Arc<SyncEngine>,
    webhook_secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(engine: Arc<SyncEngine>, webhook_secret: impl Into<String>) -> Self {
        Self {
            engine,
            webhook_secret: Some(webhook_secret.into()),
        }
    }

    /// Handler with no signing secret: every delivery fails with a configuration error
    pub fn unconfigured(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            webhook_secret: None,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// A body that fails to parse after a valid signature is treated as a bad
    /// signature too: it is rejected before any state changes.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let webhook_secret = self.webhook_secret.as_deref().ok_or_else(|| {
            BillingError::Config("STRIPE_WEBHOOK_SECRET is not configured".to_string())
        })?;

        verify_signature(
            payload,
            signature,
            webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Verify, deduplicate, and dispatch one delivery.
    ///
    /// Returns as soon as the sync is spawned. Sync failures are recorded on the
    /// event row and in the engine's run log, not returned here.
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<HandledWebhook> {
        let event = self.verify_event(payload, signature)?;

        if !is_relevant_event(&event.event_type) {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring irrelevant webhook event"
            );
            return Ok(HandledWebhook {
                outcome: WebhookOutcome::Ignored {
                    event_type: event.event_type,
                },
                sync_task: None,
            });
        }

        // Read-only, so a store error here leaves nothing claimed and Stripe's
        // retry is processed normally.
        let identity_id = self.resolve_identity(&event).await?;

        let store = Arc::clone(self.engine.store());

        match store
            .claim_webhook_event(&event.id, &event.event_type, event.timestamp())
            .await?
        {
            WebhookClaim::Claimed => {}
            WebhookClaim::Duplicate => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event"
                );
                return Ok(HandledWebhook {
                    outcome: WebhookOutcome::Duplicate,
                    sync_task: None,
                });
            }
        }

        let Some(identity_id) = identity_id else {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook event for unknown customer"
            );
            store
                .finish_webhook_event(&event.id, &WebhookResult::Ignored)
                .await?;
            return Ok(HandledWebhook {
                outcome: WebhookOutcome::UnknownCustomer,
                sync_task: None,
            });
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            identity_id = %identity_id,
            "Dispatching sync for webhook event"
        );

        let engine = Arc::clone(&self.engine);
        let event_id = event.id;
        let sync_task = tokio::spawn(async move {
            let result = engine.sync(identity_id, SyncTrigger::Webhook).await;

            let recorded = match &result {
                Ok(_) => WebhookResult::Success,
                Err(e) => WebhookResult::Error(e.to_string()),
            };
            if let Err(e) = engine
                .store()
                .finish_webhook_event(&event_id, &recorded)
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to record webhook processing result"
                );
            }

            result
        });

        Ok(HandledWebhook {
            outcome: WebhookOutcome::Dispatched { identity_id },
            sync_task: Some(sync_task),
        })
    }

    async fn resolve_identity(&self, event: &WebhookEvent) -> BillingResult<Option<Uuid>> {
        let reference = event.customer_reference();
        let store = self.engine.store();

        if let Some(customer_id) = reference.customer_id.as_deref() {
            if let Some(identity) = store.find_identity_by_customer(customer_id).await? {
                return Ok(Some(identity.id));
            }
        }

        if let Some(email) = reference.email.as_deref() {
            if let Some(identity) = store.find_identity_by_email(email).await? {
                return Ok(Some(identity.id));
            }
        }

        Ok(None)
    }
}

/// Compute a valid `Stripe-Signature` header value, for tests and local tooling
pub fn sign_payload(payload: &str, webhook_secret: &str, timestamp: i64) -> String {
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret_key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn event(object: serde_json::Value) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": { "object": object }
        }))
        .unwrap()
    }

    // =========================================================================
    // Signature verification
    // =========================================================================

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, SECRET, now());
        assert!(verify_signature(payload, &header, SECRET, now()).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign_payload(r#"{"id":"evt_1"}"#, SECRET, now());
        assert!(matches!(
            verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, now()),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = sign_payload(payload, "whsec_other", now());
        assert!(verify_signature(payload, &header, SECRET, now()).is_err());
    }

    #[test]
    fn test_old_timestamp_rejected() {
        let payload = "{}";
        let signed_at = now() - SIGNATURE_TOLERANCE_SECS - 1;
        let header = sign_payload(payload, SECRET, signed_at);
        assert!(verify_signature(payload, &header, SECRET, now()).is_err());
    }

    #[test]
    fn test_timestamp_at_tolerance_edge_accepted() {
        let payload = "{}";
        let current = now();
        let header = sign_payload(payload, SECRET, current - SIGNATURE_TOLERANCE_SECS);
        assert!(verify_signature(payload, &header, SECRET, current).is_ok());
    }

    #[test]
    fn test_any_v1_may_match() {
        let payload = "{}";
        let t = now();
        let valid = sign_payload(payload, SECRET, t);
        let valid_sig = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={t},v1=deadbeef,v1={valid_sig},v0=ignored");
        assert!(verify_signature(payload, &header, SECRET, t).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let t = now();
        let missing_sig = format!("t={t}");
        for header in ["", "v1=abc", missing_sig.as_str(), "t=notanumber,v1=abc"] {
            assert!(
                verify_signature("{}", header, SECRET, t).is_err(),
                "header {header:?} should be rejected"
            );
        }
    }

    // =========================================================================
    // Event parsing
    // =========================================================================

    #[test]
    fn test_relevant_event_types() {
        assert!(is_relevant_event("customer.subscription.deleted"));
        assert!(is_relevant_event("invoice.payment_failed"));
        assert!(is_relevant_event("checkout.session.completed"));
        assert!(!is_relevant_event("customer.created"));
        assert!(!is_relevant_event("charge.refunded"));
    }

    #[test]
    fn test_customer_id_as_string() {
        let reference = event(json!({ "customer": "cus_1" })).customer_reference();
        assert_eq!(reference.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(reference.email, None);
    }

    #[test]
    fn test_customer_id_as_expanded_object() {
        let reference =
            event(json!({ "customer": { "id": "cus_2", "object": "customer" } })).customer_reference();
        assert_eq!(reference.customer_id.as_deref(), Some("cus_2"));
    }

    #[test]
    fn test_email_fallbacks() {
        let invoice = event(json!({ "customer": null, "customer_email": "a@example.com" }));
        assert_eq!(
            invoice.customer_reference().email.as_deref(),
            Some("a@example.com")
        );

        let checkout = event(json!({ "customer_details": { "email": "b@example.com" } }));
        assert_eq!(
            checkout.customer_reference().email.as_deref(),
            Some("b@example.com")
        );

        let empty = event(json!({ "customer_email": "" }));
        assert_eq!(empty.customer_reference(), CustomerReference::default());
    }
}
