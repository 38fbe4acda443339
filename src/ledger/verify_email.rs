//! Email verification orchestration
//!
//! Consuming the record and setting the user's flag are one transaction; the
//! record row is locked first so two concurrent claims of the same code
//! serialize and only the first one succeeds.

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::OpContext;
use crate::error::{TxError, TxResult, VerifyEmailRejection};
use crate::store::models::{UpdateUserParams, UpdateVerifyEmailParams, User, VerifyEmail};
use crate::store::{Querier, Store, TxBackend};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxParams {
    pub email_id: i64,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

/// Reason a locked record cannot be claimed, checked in this order
fn rejection(record: &VerifyEmail, secret_code: &str) -> Option<VerifyEmailRejection> {
    if record.is_used {
        Some(VerifyEmailRejection::AlreadyUsed)
    } else if record.is_expired_at(Utc::now()) {
        Some(VerifyEmailRejection::Expired)
    } else if record.secret_code != secret_code {
        Some(VerifyEmailRejection::SecretMismatch)
    } else {
        None
    }
}

impl<B: TxBackend> Store<B> {
    pub async fn verify_email_tx(
        &self,
        ctx: &OpContext,
        arg: VerifyEmailTxParams,
    ) -> TxResult<VerifyEmailTxResult> {
        let email_id = arg.email_id;

        let result = self
            .run_tx(ctx, "verify_email_tx", move |q| {
                async move {
                    let record = q.get_verify_email_for_update(arg.email_id).await?;
                    if let Some(reason) = rejection(&record, &arg.secret_code) {
                        return Err(TxError::VerifyEmail(reason));
                    }

                    // still guarded in the statement; a miss here means the
                    // store's clock already passed expired_at
                    let verify_email = q
                        .update_verify_email(UpdateVerifyEmailParams {
                            id: arg.email_id,
                            secret_code: arg.secret_code,
                        })
                        .await
                        .map_err(|e| {
                            if e.is_not_found() {
                                TxError::VerifyEmail(VerifyEmailRejection::Expired)
                            } else {
                                e.into()
                            }
                        })?;

                    let user = q
                        .update_user(UpdateUserParams {
                            username: verify_email.username.clone(),
                            is_email_verified: Some(true),
                            ..Default::default()
                        })
                        .await?;

                    Ok(VerifyEmailTxResult { user, verify_email })
                }
                .boxed()
            })
            .await?;

        info!(email_id, username = %result.user.username, "Email verified");
        Ok(result)
    }
}
