//! Subscription status and plan tier types shared by the billing and API crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a status or tier string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseTypeError {
    kind: &'static str,
    value: String,
}

/// Raw subscription status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    /// Collapse the raw status into the canonical vocabulary used on identities
    pub fn canonical(&self) -> CanonicalStatus {
        match self {
            SubscriptionStatus::Active => CanonicalStatus::Active,
            SubscriptionStatus::Trialing => CanonicalStatus::Trialing,
            SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid => CanonicalStatus::PastDue,
            SubscriptionStatus::Canceled
            | SubscriptionStatus::IncompleteExpired
            | SubscriptionStatus::Paused => CanonicalStatus::Canceled,
            SubscriptionStatus::Incomplete => CanonicalStatus::None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(ParseTypeError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// Canonical subscription status stored on an identity.
///
/// Variants are declared in ascending priority so the derived `Ord` matches
/// the resolution rule: active > trialing > past_due > canceled > none.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    #[default]
    None,
    Canceled,
    PastDue,
    Trialing,
    Active,
}

impl CanonicalStatus {
    /// Every variant, lowest priority first
    pub const ALL: [CanonicalStatus; 5] = [
        CanonicalStatus::None,
        CanonicalStatus::Canceled,
        CanonicalStatus::PastDue,
        CanonicalStatus::Trialing,
        CanonicalStatus::Active,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::None => "none",
            CanonicalStatus::Canceled => "canceled",
            CanonicalStatus::PastDue => "past_due",
            CanonicalStatus::Trialing => "trialing",
            CanonicalStatus::Active => "active",
        }
    }

    /// Whether this status still entitles the identity to its paid tier
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            CanonicalStatus::Active | CanonicalStatus::Trialing | CanonicalStatus::PastDue
        )
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalStatus {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CanonicalStatus::None),
            "canceled" => Ok(CanonicalStatus::Canceled),
            "past_due" => Ok(CanonicalStatus::PastDue),
            "trialing" => Ok(CanonicalStatus::Trialing),
            "active" => Ok(CanonicalStatus::Active),
            other => Err(ParseTypeError {
                kind: "canonical status",
                value: other.to_string(),
            }),
        }
    }
}

/// Plan tier derived from the subscription's price
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Starter,
    Pro,
    Team,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
            PlanTier::Team => "team",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "starter" => Ok(PlanTier::Starter),
            "pro" => Ok(PlanTier::Pro),
            "team" => Ok(PlanTier::Team),
            "enterprise" => Ok(PlanTier::Enterprise),
            _ => Err(ParseTypeError {
                kind: "plan tier",
                value: s.to_string(),
            }),
        }
    }
}
