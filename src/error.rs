//! Orchestration Error Types
//!
//! Every failure of a coordinated operation surfaces as a [`TxError`]. Whatever
//! the variant, the store is left in its pre-transaction state.

use thiserror::Error;

use crate::store::{StoreError, StoreErrorKind};

/// Bad arguments. Rejected before a transaction opens (except the currency
/// check, which needs the locked rows) and never retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Source and destination accounts are the same: {0}")]
    SameAccount(i64),

    #[error("Amount must be greater than zero, got {0}")]
    NonPositiveAmount(i64),

    #[error("Currency mismatch: account {from_account_id} holds {from}, account {to_account_id} holds {to}")]
    CurrencyMismatch {
        from_account_id: i64,
        from: String,
        to_account_id: i64,
        to: String,
    },
}

/// Why a verification claim was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyEmailRejection {
    #[error("verification code already used")]
    AlreadyUsed,

    #[error("verification code expired")]
    Expired,

    #[error("verification code does not match")]
    SecretMismatch,
}

/// Coarse classification for upstream response mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Rejected,
    Cancelled,
    Internal,
}

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Invalid argument: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Email verification rejected: {0}")]
    VerifyEmail(VerifyEmailRejection),

    #[error("After-create hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    /// Rollback failed after the unit of work failed; both are kept
    #[error("tx error: {cause}, rb error: {rollback}")]
    RollbackFailed {
        cause: Box<TxError>,
        rollback: StoreError,
    },
}

pub type TxResult<T> = Result<T, TxError>;

impl TxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TxError::Validation(_) => ErrorKind::Validation,
            TxError::Store(e) => match e.kind() {
                StoreErrorKind::NotFound => ErrorKind::NotFound,
                StoreErrorKind::UniqueViolation => ErrorKind::Conflict,
                StoreErrorKind::Other => ErrorKind::Internal,
            },
            TxError::VerifyEmail(_) => ErrorKind::Rejected,
            TxError::Hook(_) => ErrorKind::Internal,
            TxError::Cancelled | TxError::DeadlineExceeded => ErrorKind::Cancelled,
            TxError::RollbackFailed { .. } => ErrorKind::Internal,
        }
    }

    /// The failure that aborted the unit of work, looking through a failed rollback
    pub fn root_cause(&self) -> &TxError {
        match self {
            TxError::RollbackFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TxError::Validation(ValidationError::SameAccount(_)) => "SAME_ACCOUNT",
            TxError::Validation(ValidationError::NonPositiveAmount(_)) => "INVALID_AMOUNT",
            TxError::Validation(ValidationError::CurrencyMismatch { .. }) => "CURRENCY_MISMATCH",
            TxError::Store(StoreError::NotFound { .. }) => "NOT_FOUND",
            TxError::Store(StoreError::UniqueViolation { .. }) => "ALREADY_EXISTS",
            TxError::Store(StoreError::Other(_)) => "DATABASE_ERROR",
            TxError::VerifyEmail(VerifyEmailRejection::AlreadyUsed) => "VERIFY_EMAIL_USED",
            TxError::VerifyEmail(VerifyEmailRejection::Expired) => "VERIFY_EMAIL_EXPIRED",
            TxError::VerifyEmail(VerifyEmailRejection::SecretMismatch) => "VERIFY_EMAIL_MISMATCH",
            TxError::Hook(_) => "HOOK_FAILED",
            TxError::Cancelled => "CANCELLED",
            TxError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            TxError::RollbackFailed { .. } => "ROLLBACK_FAILED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Rejected => 422,
            ErrorKind::Cancelled => match self {
                TxError::DeadlineExceeded => 504,
                _ => 499,
            },
            ErrorKind::Internal => 500,
        }
    }
}
