//! Domain error types shared by every engine module.
//!
//! Domain code raises typed errors; transactional boundaries roll back
//! before an error escapes. The HTTP boundary (external to this crate)
//! maps each kind to a status code via [`AppError::status_code`].

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// Resource does not exist or is not visible to the caller.
    #[error("Not found: {0}")]
    EntityNotFound(String),

    /// Owner mismatch.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Invariant or validation violation.
    #[error("Business rule violation: {0}")]
    BusinessRule(String),

    /// No LIFO depth and no market rate; the caller can prompt for input.
    #[error("Exchange rate unavailable: {0}")]
    ExchangeRateUnavailable(String),

    /// External price source exhausted its daily quota.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status the external boundary maps this kind to.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::EntityNotFound(_) => 404,
            AppError::AccessDenied(_) => 403,
            AppError::BusinessRule(_) => 400,
            AppError::ExchangeRateUnavailable(_) => 422,
            AppError::RateLimitExceeded(_) => 429,
            AppError::Database(_) | AppError::Unexpected(_) => 500,
        }
    }

    /// Stable machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::EntityNotFound(_) => "EntityNotFound",
            AppError::AccessDenied(_) => "AccessDenied",
            AppError::BusinessRule(_) => "BusinessRule",
            AppError::ExchangeRateUnavailable(_) => "ExchangeRateUnavailable",
            AppError::RateLimitExceeded(_) => "RateLimitExceeded",
            AppError::Database(_) | AppError::Unexpected(_) => "Unexpected",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.to_string(),
            status_code: self.status_code(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// JSON body returned by the external HTTP boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: String,
    pub status_code: u16,
    pub timestamp: String,
}
