//! User registration orchestration
//!
//! The user row and the after-create hook commit together. If the hook fails
//! the user is rolled back and the username stays free.
//!
//! The hook runs inside the database transaction but whatever it talks to
//! does not. When the hook enqueues onto an external queue, a successful
//! return only means the enqueue call succeeded; if the commit then fails the
//! task is already out and its consumer must tolerate a missing user.

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::info;

use crate::context::OpContext;
use crate::error::{TxError, TxResult};
use crate::store::models::{CreateUserParams, User};
use crate::store::{Querier, Store, TxBackend};

/// Side effect run with the freshly created user before commit
pub type AfterCreateHook = Box<dyn FnOnce(User) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub fn noop_hook() -> AfterCreateHook {
    Box::new(|_user| async { Ok(()) }.boxed())
}

pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: AfterCreateHook,
}

impl CreateUserTxParams {
    pub fn new(params: CreateUserParams, after_create: AfterCreateHook) -> Self {
        Self {
            params,
            after_create,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserTxResult {
    pub user: User,
}

impl<B: TxBackend> Store<B> {
    pub async fn create_user_tx(
        &self,
        ctx: &OpContext,
        arg: CreateUserTxParams,
    ) -> TxResult<CreateUserTxResult> {
        let CreateUserTxParams {
            params,
            after_create,
        } = arg;

        let result = self
            .run_tx(ctx, "create_user_tx", move |q| {
                async move {
                    let user = q.create_user(params).await?;
                    after_create(user.clone()).await.map_err(TxError::Hook)?;
                    Ok(CreateUserTxResult { user })
                }
                .boxed()
            })
            .await?;

        info!(username = %result.user.username, "User registered");
        Ok(result)
    }
}
