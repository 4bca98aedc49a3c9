//! Error taxonomy for the ledger core.
//!
//! Every mutating operation returns one of these kinds; callers (the HTTP
//! router, in this system) map them onto status codes. Conditional failures
//! from the store are never retried blindly; they are re-read and
//! reclassified into the variant below that best describes what happened.

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("insufficient credits: requested {requested} available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited,

    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoreError {
    /// Conditional failures are surfaced as `Conflict` by default; callers
    /// that need a more specific kind (e.g. `InsufficientCredits`,
    /// `NotFound`) re-read state themselves and construct it directly rather
    /// than relying on this blanket conversion.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed { reason } => CoreError::Conflict(reason),
            StoreError::Transient(msg) => CoreError::Transient(msg),
            StoreError::Internal(msg) => CoreError::Internal(msg),
        }
    }
}
