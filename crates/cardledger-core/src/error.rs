//! Unified error handling for CardLedger
//!
//! Declines are not errors: the authorization engine reports them as
//! decisions. Everything here is either a validation fault, an unresolvable
//! reference, a gate rejection, or a storage fault. Storage faults leave
//! state untouched and are the only retryable kind.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Storage Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Timed out waiting for lock on account {0}")]
    LockTimeout(i64),

    // ==================== Ledger Errors ====================
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Card not found: {0}")]
    CardNotFound(String),

    #[error("Referral not found: {0}")]
    ReferralNotFound(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Provider transaction already recorded: {0}")]
    DuplicateProviderTransaction(String),

    #[error("Card {0} is not active")]
    CardNotActive(i64),

    #[error("Card {0} reached the failed attempt limit")]
    FraudThresholdReached(i64),

    // ==================== Webhook Gate Errors ====================
    #[error("Source address not allowed: {0}")]
    OriginRejected(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // ==================== Validation Errors ====================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ==================== External Service Errors ====================
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Notification failed: {0}")]
    Notification(String),
}

impl AppError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation(_) | AppError::InvalidInput(_) | AppError::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }

            // 401 Unauthorized
            AppError::InvalidSignature => StatusCode::UNAUTHORIZED,

            // 402 Payment Required
            AppError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,

            // 403 Forbidden
            AppError::OriginRejected(_) => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::AccountNotFound(_)
            | AppError::CardNotFound(_)
            | AppError::ReferralNotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::DuplicateProviderTransaction(_)
            | AppError::CardNotActive(_)
            | AppError::FraudThresholdReached(_) => StatusCode::CONFLICT,

            // 502 Bad Gateway
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::LockTimeout(_) | AppError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Transaction(_) => "transaction_error",
            AppError::LockTimeout(_) => "lock_timeout",
            AppError::AccountNotFound(_) => "account_not_found",
            AppError::CardNotFound(_) => "card_not_found",
            AppError::ReferralNotFound(_) => "referral_not_found",
            AppError::InsufficientBalance { .. } => "insufficient_balance",
            AppError::DuplicateProviderTransaction(_) => "duplicate_provider_transaction",
            AppError::CardNotActive(_) => "card_not_active",
            AppError::FraudThresholdReached(_) => "fraud_threshold_reached",
            AppError::OriginRejected(_) => "origin_rejected",
            AppError::InvalidSignature => "invalid_signature",
            AppError::InvalidPayload(_) => "invalid_payload",
            AppError::Validation(_) => "validation_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Provider(_) => "provider_error",
            AppError::Notification(_) => "notification_error",
        }
    }

    /// Storage faults: nothing was written and the caller may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Pool(_)
                | AppError::Transaction(_)
                | AppError::LockTimeout(_)
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "status": status.as_u16(),
            "retryable": self.is_retryable(),
        });

        HttpResponse::build(status).json(body)
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::InvalidSignature.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::CardNotFound("ext-1".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::InsufficientBalance {
                required: "10.00".to_string(),
                available: "5.00".to_string()
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            AppError::OriginRejected("10.0.0.1".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::LockTimeout(7).error_code(), "lock_timeout");
        assert_eq!(
            AppError::DuplicateProviderTransaction("tx-1".to_string()).error_code(),
            "duplicate_provider_transaction"
        );
        assert_eq!(AppError::CardNotActive(3).error_code(), "card_not_active");
        assert_eq!(
            AppError::FraudThresholdReached(3).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_only_storage_faults_are_retryable() {
        assert!(AppError::LockTimeout(1).is_retryable());
        assert!(AppError::Database("down".to_string()).is_retryable());
        assert!(!AppError::InvalidSignature.is_retryable());
        assert!(!AppError::InsufficientBalance {
            required: "1".to_string(),
            available: "0".to_string()
        }
        .is_retryable());
    }
}
