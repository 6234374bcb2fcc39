//! Environment-driven configuration.
//!
//! Every knob has a default so a bare process starts against a local
//! SQLite file with TWD as home currency.

use std::env;

use crate::error::{AppError, Result};

/// Minimum JWT secret length in bytes. The secret itself is consumed by the
/// external auth middleware; the core only validates the constraint.
const MIN_JWT_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Reporting currency for every user unless overridden.
    pub home_currency: String,
    /// Daily request ceiling for the Taiwan Stock Exchange source.
    pub twse_daily_quota: u32,
    /// Per-request deadline for outbound market-data calls, in seconds.
    pub request_timeout_secs: u64,
    /// Base URL of the FX rate API.
    pub fx_api_url: String,
    /// Base URL of the TWSE daily quote API.
    pub twse_api_url: String,
    /// Secret consumed by the external JWT middleware.
    pub jwt_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        // Load .env if present; silently fall back to process env.
        let _ = dotenvy::dotenv();

        Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "investment-tracker.db".to_string()),
            home_currency: env::var("HOME_CURRENCY").unwrap_or_else(|_| "TWD".to_string()),
            twse_daily_quota: env::var("TWSE_DAILY_QUOTA")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            request_timeout_secs: env::var("MARKET_DATA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            fx_api_url: env::var("FX_API_URL")
                .unwrap_or_else(|_| "https://api.exchangerate.host".to_string()),
            twse_api_url: env::var("TWSE_API_URL")
                .unwrap_or_else(|_| "https://www.twse.com.tw".to_string()),
            jwt_secret: env::var("JWT_SECRET").ok(),
        }
    }

    /// Validate constraints that cannot be defaulted away.
    pub fn validate(&self) -> Result<()> {
        if let Some(secret) = &self.jwt_secret {
            if secret.len() < MIN_JWT_SECRET_BYTES {
                return Err(AppError::BusinessRule(format!(
                    "JWT_SECRET must be at least {} bytes, got {}",
                    MIN_JWT_SECRET_BYTES,
                    secret.len()
                )));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "investment-tracker.db".to_string(),
            home_currency: "TWD".to_string(),
            twse_daily_quota: 1000,
            request_timeout_secs: 10,
            fx_api_url: "https://api.exchangerate.host".to_string(),
            twse_api_url: "https://www.twse.com.tw".to_string(),
            jwt_secret: None,
        }
    }
}
