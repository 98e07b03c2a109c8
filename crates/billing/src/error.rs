//! Error taxonomy for the billing engine.
//!
//! Caller-misuse errors (insufficient funds, not-found) surface synchronously
//! for user-facing messaging. Storage errors abort the enclosing transaction,
//! which rolls back on drop, so a failed operation is always safe to retry
//! from scratch. A lost optimistic re-check during renewal is NOT an error:
//! it is reported as a skipped outcome (see [`crate::store::RenewalOutcome`]),
//! because the resource was simply renewed by another in-flight operation.

use thiserror::Error;
use uuid::Uuid;

use crate::resources::ResourceStatus;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("account {0} not found")]
    AccountNotFound(Uuid),

    #[error("resource {0} not found")]
    ResourceNotFound(Uuid),

    #[error("billing log entry {0} not found")]
    LogEntryNotFound(Uuid),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    /// Retry of a failed renewal found the owner still short.
    #[error("still insufficient funds: required {required}, available {available}")]
    StillInsufficientFunds { required: i64, available: i64 },

    #[error("billing log entry is not retryable: {0}")]
    NotRetryable(String),

    #[error("resource {resource_id} cannot {action} from status {from}")]
    InvalidTransition {
        resource_id: Uuid,
        from: ResourceStatus,
        action: &'static str,
    },

    #[error("invalid {field} value in storage: {value}")]
    Decode { field: &'static str, value: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl From<pagemint_shared::ConfigError> for BillingError {
    fn from(e: pagemint_shared::ConfigError) -> Self {
        BillingError::Config(e.to_string())
    }
}
