//! Account lock ordering
//!
//! Any transaction touching two accounts locks the lower ID first. Two
//! transfers sharing an account then always queue on the same row first, so no
//! circular wait can form.

use crate::error::ValidationError;

/// Validate transfer arguments before a transaction opens
pub fn validate_transfer(
    from_account_id: i64,
    to_account_id: i64,
    amount: i64,
) -> Result<(), ValidationError> {
    if from_account_id == to_account_id {
        return Err(ValidationError::SameAccount(from_account_id));
    }
    if amount <= 0 {
        return Err(ValidationError::NonPositiveAmount(amount));
    }
    Ok(())
}

/// One balance change inside a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceDelta {
    pub account_id: i64,
    pub amount: i64,
}

/// `(lower, higher)` of two account IDs
pub fn lock_order(a: i64, b: i64) -> (i64, i64) {
    if a < b { (a, b) } else { (b, a) }
}

/// Debit and credit of a transfer in the order they must be applied
pub fn ordered_deltas(from_account_id: i64, to_account_id: i64, amount: i64) -> [BalanceDelta; 2] {
    let debit = BalanceDelta {
        account_id: from_account_id,
        amount: -amount,
    };
    let credit = BalanceDelta {
        account_id: to_account_id,
        amount,
    };
    if from_account_id < to_account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}
