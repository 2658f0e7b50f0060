use crate::database::DatabaseError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Error as SqlxError;
use thiserror::Error;
use uuid::Uuid;

/// Application-level error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Debit or lock exceeds what the account can spend. Never retried.
    #[error("Insufficient balance on {account}: available {available}, requested {requested}")]
    InsufficientBalance {
        account: String,
        available: Decimal,
        requested: Decimal,
    },

    /// The operator float cannot fund a payout owed to a player or agent.
    /// Resolved by topping up the float, so it is not retryable.
    #[error("Operator float {account} cannot fund payout: available {available}, requested {requested}")]
    OperatorUnderfunded {
        account: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Account lock contention. Safe to retry with backoff.
    #[error("Timed out after {waited_ms}ms waiting for account locks")]
    LockTimeout { waited_ms: u64 },

    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("No active jurisdiction rule for {country}/{profile}")]
    RuleNotFound { country: String, profile: String },

    #[error("Settlement already exists for beneficiary {beneficiary_id} in period {period_start} - {period_end}")]
    DuplicateSettlement {
        beneficiary_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },

    #[error("Audit chain broken at sequence {sequence}: {reason}")]
    AuditChainBroken { sequence: i64, reason: String },

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database errors
    #[error("SQL error: {0}")]
    Sqlx(#[from] SqlxError),

    /// Storage backend errors that have no business meaning
    #[error("Storage error: {0}")]
    Store(String),

    /// A unique key already holds this record. Replaying will not help.
    #[error("Record already exists: {constraint}")]
    Duplicate { constraint: String },

    /// Optimistic concurrency conflict at commit. Safe to retry.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Message(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Contention errors the caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::LockTimeout { .. } | AppError::Conflict(_))
    }

    /// Check if error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_) | AppError::WalletNotFound(_))
    }

    /// Message safe to show an end user. Anything without a precise,
    /// actionable meaning collapses to a generic failure that carries the
    /// correlation id of the audit/ledger rows for support.
    pub fn user_message(&self, correlation_id: Uuid) -> String {
        match self {
            AppError::InsufficientBalance {
                available,
                requested,
                ..
            } => format!(
                "Insufficient balance: {} available, {} required",
                available, requested
            ),
            AppError::CurrencyMismatch { expected, actual } => format!(
                "This account operates in {}; the request used {}",
                expected, actual
            ),
            AppError::Validation(msg) => msg.clone(),
            AppError::Duplicate { .. } | AppError::DuplicateSettlement { .. } => {
                "This request has already been processed".to_string()
            }
            AppError::LockTimeout { .. } | AppError::Conflict(_) => {
                "The system is busy, please try again".to_string()
            }
            _ => format!(
                "The request could not be completed (reference {})",
                correlation_id
            ),
        }
    }

    /// Get HTTP status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::NotFound(_) | AppError::WalletNotFound(_) => 404,
            AppError::Validation(_)
            | AppError::CurrencyMismatch { .. }
            | AppError::InsufficientBalance { .. } => 422,
            AppError::LockTimeout { .. } | AppError::OperatorUnderfunded { .. } => 503,
            AppError::Conflict(_)
            | AppError::Duplicate { .. }
            | AppError::DuplicateSettlement { .. } => 409,
            AppError::Config(_) => 500,
            AppError::Database(_) | AppError::Sqlx(_) | AppError::Store(_) => 500,
            _ => 500,
        }
    }
}

/// Storage-layer error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database query error
    #[error("Query error: {0}")]
    Query(SqlxError),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Unique constraint tripped
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Version check failed or an archive target was no longer active
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Row could not be mapped back to a model
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    /// Fault raised by a test fail point
    #[error("Injected fault: {0}")]
    Injected(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Query(e) => AppError::Sqlx(e),
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::Duplicate(constraint) => AppError::Duplicate { constraint },
            StoreError::ConstraintViolation(msg) => AppError::Validation(msg),
            other => AppError::Store(other.to_string()),
        }
    }
}

impl From<SqlxError> for StoreError {
    fn from(err: SqlxError) -> Self {
        match &err {
            SqlxError::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            SqlxError::Database(db_err) => {
                // Check for common PostgreSQL error codes
                let code = db_err.code().map(|c| c.to_string());
                match code.as_deref() {
                    // Unique violation
                    Some("23505") => StoreError::Duplicate(
                        db_err
                            .constraint()
                            .map(str::to_string)
                            .unwrap_or_else(|| db_err.message().to_string()),
                    ),
                    // Foreign key / check violation
                    Some("23503") | Some("23514") => {
                        StoreError::ConstraintViolation(db_err.message().to_string())
                    }
                    _ => StoreError::Query(err),
                }
            }
            _ => StoreError::Query(err),
        }
    }
}
