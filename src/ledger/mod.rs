//! Ledger orchestrations
//!
//! Multi-step operations that run as one transaction on [`crate::store::Store`]:
//! - `open_account`: account row plus its opening entry
//! - `transfer_tx`: transfer record, paired entries, both balances
//! - `create_user_tx`: user row plus a caller-supplied after-create hook
//! - `verify_email_tx`: consume a verification record and flag the user

pub mod audit;
pub mod lock_order;
pub mod register;
pub mod transfer;
pub mod verify_email;

pub use audit::{AuditReport, InvariantViolation, check_transfer_result};
pub use lock_order::{lock_order, validate_transfer};
pub use register::{AfterCreateHook, CreateUserTxParams, CreateUserTxResult, noop_hook};
pub use transfer::{OpenAccountResult, TransferTxParams, TransferTxResult};
pub use verify_email::{VerifyEmailTxParams, VerifyEmailTxResult};
