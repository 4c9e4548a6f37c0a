//! Server configuration

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_WEBHOOK_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Server configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Bearer token for `/admin/*`. Admin routes reject everything while unset.
    pub admin_api_token: Option<String>,
    /// Processed webhook events older than this are pruned daily
    pub webhook_retention_days: i64,
    /// `ENABLE_BILLING=false` runs without Stripe credentials
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let admin_api_token = std::env::var("ADMIN_API_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        let webhook_retention_days = match std::env::var("WEBHOOK_RETENTION_DAYS") {
            Ok(raw) => parse_retention_days(&raw)?,
            Err(_) => DEFAULT_WEBHOOK_RETENTION_DAYS,
        };

        let enable_billing = std::env::var("ENABLE_BILLING")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        Ok(Self {
            database_url,
            bind_address,
            admin_api_token,
            webhook_retention_days,
            enable_billing,
        })
    }
}

fn parse_retention_days(raw: &str) -> Result<i64, ConfigError> {
    let days: i64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key: "WEBHOOK_RETENTION_DAYS",
        reason: format!("'{raw}' is not a number"),
    })?;
    if days < 1 {
        return Err(ConfigError::Invalid {
            key: "WEBHOOK_RETENTION_DAYS",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(days)
}
