//! Typed health reporting for billing collaborators

use serde::Serialize;

/// Health of a collaborator (store or provider client)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Reachable but reporting errors (e.g. rate limited)
    Degraded(String),
    Unavailable(String),
    /// Credentials were never provided
    Unconfigured,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}
