//! Bank Ledger - Transactional Funds-Transfer Core
//!
//! Multi-step ledger operations run as single database transactions:
//! transfers lock accounts lower-ID-first and write paired entries,
//! registration commits the user together with its after-create hook,
//! and email verification consumes a code and flags the user atomically.
//!
//! # Modules
//!
//! - [`store`] - Query layer, backends (PostgreSQL, in-memory) and the transaction coordinator
//! - [`ledger`] - Transfer, registration and verification orchestrations, audit
//! - [`task`] - Verification email task distribution and processing
//! - [`context`] - Cancellation and deadlines for every operation
//! - [`error`] - Orchestration error taxonomy
//! - [`config`] / [`logging`] - Environment YAML config and tracing setup

pub mod config;
pub mod context;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod store;
pub mod task;

// Convenient re-exports at crate root
pub use context::OpContext;
pub use error::{ErrorKind, TxError, TxResult, ValidationError, VerifyEmailRejection};
pub use ledger::{
    CreateUserTxParams, CreateUserTxResult, TransferTxParams, TransferTxResult,
    VerifyEmailTxParams, VerifyEmailTxResult,
};
pub use store::{Database, MemoryBackend, PgBackend, Querier, Store, StoreError, TxCoordinator};
