//! Transactional Operation Coordinator
//!
//! Runs a unit of work against a transaction-scoped [`Querier`] and either
//! commits everything it did or rolls all of it back.
//!
//! ```text
//! begin ──fail / ctx done──▶ Err (unit of work never runs)
//!   │
//!   ▼
//! work(&mut tx) ──Ok──▶ commit ──▶ Ok / commit error as-is
//!   │
//!   ├──Err────────────▶ rollback ──ok──▶ Err(cause)
//!   │                       └──fail──▶ Err(RollbackFailed { cause, rollback })
//!   └──ctx done───────▶ rollback ──▶ Err(Cancelled | DeadlineExceeded)
//!
//! A context that fired while the work was finishing still rolls back.
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use super::error::StoreResult;
use super::querier::Querier;
use crate::context::{Interrupt, OpContext};
use crate::error::{TxError, TxResult};

/// Backing store able to open transactions
///
/// `Handle` serves both roles: [`TxBackend::handle`] returns an autocommit
/// handle where each call is its own statement, [`TxBackend::begin`] returns
/// one bound to a fresh transaction.
#[async_trait]
pub trait TxBackend: Send + Sync + 'static {
    type Handle: Querier + Send;

    fn handle(&self) -> Self::Handle;

    async fn begin(&self) -> StoreResult<Self::Handle>;

    async fn commit(&self, tx: Self::Handle) -> StoreResult<()>;

    async fn rollback(&self, tx: Self::Handle) -> StoreResult<()>;
}

pub struct TxCoordinator<B: TxBackend> {
    backend: Arc<B>,
}

impl<B: TxBackend> Clone for TxCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: TxBackend> TxCoordinator<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Execute `work` inside one transaction
    ///
    /// `work` is invoked exactly once, and only if the transaction opened. Its
    /// future borrows the transaction handle and must not outlive it.
    pub async fn exec_tx<T, F>(&self, ctx: &OpContext, op: &'static str, work: F) -> TxResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut B::Handle) -> BoxFuture<'t, TxResult<T>> + Send,
    {
        if let Some(interrupt) = ctx.interrupted() {
            return Err(interrupt_error(interrupt));
        }

        // begin may wait behind other transactions; a context that fires
        // meanwhile wins over a begin that completes in the same poll
        let mut tx = tokio::select! {
            biased;
            interrupt = ctx.done() => return Err(interrupt_error(interrupt)),
            begun = self.backend.begin() => begun.map_err(|e| {
                warn!(op, error = %e, "Failed to begin transaction");
                TxError::from(e)
            })?,
        };
        debug!(op, "Transaction started");

        let outcome = {
            let fut = work(&mut tx);
            tokio::select! {
                biased;
                interrupt = ctx.done() => Err(interrupt_error(interrupt)),
                res = fut => res,
            }
        };

        // never commit on behalf of a context that has already fired
        let outcome = match (outcome, ctx.interrupted()) {
            (Ok(_), Some(interrupt)) => Err(interrupt_error(interrupt)),
            (outcome, _) => outcome,
        };

        match outcome {
            Ok(value) => {
                self.backend.commit(tx).await.map_err(|e| {
                    error!(op, error = %e, "Commit failed");
                    TxError::from(e)
                })?;
                debug!(op, "Transaction committed");
                Ok(value)
            }
            Err(cause) => match self.backend.rollback(tx).await {
                Ok(()) => {
                    warn!(op, error = %cause, "Transaction rolled back");
                    Err(cause)
                }
                Err(rollback) => {
                    error!(op, error = %cause, rollback_error = %rollback, "Rollback failed");
                    Err(TxError::RollbackFailed {
                        cause: Box::new(cause),
                        rollback,
                    })
                }
            },
        }
    }
}

fn interrupt_error(interrupt: Interrupt) -> TxError {
    match interrupt {
        Interrupt::Cancelled => TxError::Cancelled,
        Interrupt::DeadlineExceeded => TxError::DeadlineExceeded,
    }
}
