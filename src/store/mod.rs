//! Ledger storage
//!
//! [`Store`] is the public face of the storage layer. It composes two
//! capabilities explicitly:
//! - [`Store::queries`]: autocommit pass-through to the query layer
//! - [`Store::coordinator`]: the transactional coordinator the orchestrations run on

pub mod coordinator;
pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod querier;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

pub use coordinator::{TxBackend, TxCoordinator};
pub use error::{StoreError, StoreErrorKind, StoreResult};
pub use memory::MemoryBackend;
pub use postgres::{Database, PgBackend};
pub use querier::Querier;

use crate::context::OpContext;
use crate::error::TxResult;

pub struct Store<B: TxBackend> {
    backend: Arc<B>,
    coordinator: TxCoordinator<B>,
    tx_timeout: Option<Duration>,
}

impl<B: TxBackend> Clone for Store<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            coordinator: self.coordinator.clone(),
            tx_timeout: self.tx_timeout,
        }
    }
}

impl<B: TxBackend> Store<B> {
    pub fn new(backend: B) -> Self {
        let backend = Arc::new(backend);
        Self {
            coordinator: TxCoordinator::new(Arc::clone(&backend)),
            backend,
            tx_timeout: None,
        }
    }

    /// Bound every orchestration by `timeout` on top of the caller's context
    pub fn with_tx_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// Autocommit query handle; every call is its own statement
    pub fn queries(&self) -> B::Handle {
        self.backend.handle()
    }

    pub fn coordinator(&self) -> &TxCoordinator<B> {
        &self.coordinator
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `work` through the coordinator under the store's default deadline
    pub(crate) async fn run_tx<T, F>(
        &self,
        ctx: &OpContext,
        op: &'static str,
        work: F,
    ) -> TxResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut B::Handle) -> BoxFuture<'t, TxResult<T>> + Send,
    {
        match self.tx_timeout {
            Some(timeout) => {
                let scoped = ctx.child().with_timeout(timeout);
                self.coordinator.exec_tx(&scoped, op, work).await
            }
            None => self.coordinator.exec_tx(ctx, op, work).await,
        }
    }
}
