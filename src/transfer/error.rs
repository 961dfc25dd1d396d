//! Transfer error types
//!
//! Five kinds, each with a stable code. Retry policy is part of the contract:
//! `StateMutation` and `StorageFailure` are safe to retry because every leg is
//! idempotent; the other kinds are terminal for the call.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Request shape or business-rule violation
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Saga is rolling back or rolled back; never retry the forward call
    #[error("Transfer already rolled back")]
    AlreadyRolledBack,

    /// Invariant violated or race detected
    #[error("State mutation: {0}")]
    StateMutation(String),

    /// Guarded deduction found no eligible balance
    #[error("Insufficient amount")]
    InsufficientAmount,

    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl TransferError {
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidParams(_) => "INVALID_PARAMS",
            TransferError::AlreadyRolledBack => "ALREADY_ROLLED_BACK",
            TransferError::StateMutation(_) => "STATE_MUTATION",
            TransferError::InsufficientAmount => "INSUFFICIENT_AMOUNT",
            TransferError::StorageFailure(_) => "STORAGE_FAILURE",
        }
    }

    /// Whether the caller may retry the same request verbatim
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::StateMutation(_) | TransferError::StorageFailure(_)
        )
    }

    pub(crate) fn state_mutation(msg: impl Into<String>) -> Self {
        TransferError::StateMutation(msg.into())
    }
}

impl From<StoreError> for TransferError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateKey => {
                TransferError::StateMutation("concurrent insert on unique key".to_string())
            }
            StoreError::Backend(msg) | StoreError::Corrupt(msg) => {
                TransferError::StorageFailure(msg)
            }
        }
    }
}
