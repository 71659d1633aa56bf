//! Ledger error taxonomy
//!
//! Business rejections (full contest, insufficient funds, ...) are distinct
//! variants so the API layer can report them as specific statuses. Store and
//! gateway faults are "unknown outcome" conditions: every money-moving
//! operation is idempotent by id, so callers may simply retry.

use thiserror::Error;

use crate::money::Amount;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },
    #[error("already joined contest {0}")]
    AlreadyJoined(String),
    #[error("contest {0} is full")]
    ContestFull(String),
    #[error("contest {0} is not accepting entries")]
    ContestClosed(String),
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("{0} is being processed by another worker")]
    Busy(String),
    #[error("payment gateway error: {0}")]
    Gateway(String),
    #[error("ledger store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    /// Faults where the effect may or may not have landed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Store(_) | LedgerError::Gateway(_) | LedgerError::Busy(_)
        )
    }

    /// Wire status string used in API responses.
    pub fn status_code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "INVALID_REQUEST",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::Forbidden(_) => "FORBIDDEN",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::AlreadyJoined(_) => "ALREADY_JOINED",
            LedgerError::ContestFull(_) => "CONTEST_FULL",
            LedgerError::ContestClosed(_) => "CONTEST_CLOSED",
            LedgerError::InvalidTransition(_) => "INVALID_TRANSITION",
            LedgerError::Busy(_) => "IN_PROGRESS",
            LedgerError::Gateway(_) => "GATEWAY_ERROR",
            LedgerError::Store(_) => "TRY_AGAIN",
        }
    }
}
