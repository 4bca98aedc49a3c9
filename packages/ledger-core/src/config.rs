//! Environment configuration: `std::env::var` with a sensible default per
//! field, no config-file crate.

use crate::idempotency::DEFAULT_TTL_DAYS;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub api_base_path: String,
    pub db_table_name: String,
    pub db_table_region: String,
    /// Opaque passthrough, the core never validates a JWT (out of scope).
    pub jwt_secret: String,
    pub jwt_expires_in: String,
    pub salt_rounds: u32,
    pub idempotency_ttl_days: i64,
    /// Absence disables event emission; no SQS/SNS client is implemented.
    pub queue_url: Option<String>,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_path: std::env::var("API_BASE_PATH").unwrap_or_else(|_| "/api".to_string()),
            db_table_name: std::env::var("DB_TABLE_NAME").unwrap_or_else(|_| "kudu-ledger".to_string()),
            db_table_region: std::env::var("DB_TABLE_REGION").unwrap_or_else(|_| "af-south-1".to_string()),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_default(),
            jwt_expires_in: std::env::var("JWT_EXPIRES_IN").unwrap_or_else(|_| "1d".to_string()),
            salt_rounds: std::env::var("SALT_ROUNDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            idempotency_ttl_days: std::env::var("IDEMPOTENCY_TTL_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TTL_DAYS),
            queue_url: std::env::var("QUEUE_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_when_env_unset() {
        let config = CoreConfig {
            api_base_path: "/api".into(),
            db_table_name: "kudu-ledger".into(),
            db_table_region: "af-south-1".into(),
            jwt_secret: String::new(),
            jwt_expires_in: "1d".into(),
            salt_rounds: 10,
            idempotency_ttl_days: 14,
            queue_url: None,
        };
        assert_eq!(config.idempotency_ttl_days, DEFAULT_TTL_DAYS);
        assert!(config.queue_url.is_none());
    }
}
