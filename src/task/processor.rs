use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;
use tracing::{error, info, warn};

use super::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, Task, TaskQueue};
use crate::config::VerifyEmailConfig;
use crate::context::OpContext;
use crate::store::models::{CreateVerifyEmailParams, VerifyEmail};
use crate::store::{Querier, Store, TxBackend};

const SECRET_CODE_LEN: usize = 32;
const MAX_RETRY_DELAY_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ProcessError {
    /// Retrying cannot help
    #[error("{0}: skip retry")]
    SkipRetry(#[source] anyhow::Error),

    #[error(transparent)]
    Retry(anyhow::Error),
}

#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process_task(&self, ctx: &OpContext, task: &Task) -> Result<(), ProcessError>;
}

pub fn random_secret_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_CODE_LEN)
        .map(char::from)
        .collect()
}

/// Issues a verification record for a newly registered user
///
/// Mail delivery is not wired up; the verification link is logged instead.
pub struct VerifyEmailProcessor<B: TxBackend> {
    store: Store<B>,
    ttl: chrono::Duration,
    link_base_url: String,
}

impl<B: TxBackend> VerifyEmailProcessor<B> {
    pub fn new(store: Store<B>, config: &VerifyEmailConfig) -> Self {
        Self {
            store,
            ttl: chrono::Duration::minutes(config.ttl_minutes),
            link_base_url: config.link_base_url.clone(),
        }
    }

    pub async fn process_task_send_verify_email(
        &self,
        task: &Task,
    ) -> Result<VerifyEmail, ProcessError> {
        let payload: PayloadSendVerifyEmail = serde_json::from_slice(&task.payload)
            .map_err(|e| ProcessError::SkipRetry(anyhow::anyhow!("failed to unmarshal payload: {e}")))?;

        let mut q = self.store.queries();
        let user = q.get_user(&payload.username).await.map_err(|e| {
            if e.is_not_found() {
                ProcessError::SkipRetry(anyhow::anyhow!("user {} doesn't exist", payload.username))
            } else {
                ProcessError::Retry(anyhow::Error::new(e).context("failed to get user"))
            }
        })?;

        let record = q
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: random_secret_code(),
                expired_at: Utc::now() + self.ttl,
            })
            .await
            .map_err(|e| ProcessError::Retry(anyhow::Error::new(e).context("failed to create verify email")))?;

        let link = format!(
            "{}?email_id={}&secret_code={}",
            self.link_base_url, record.id, record.secret_code
        );
        info!(
            kind = %task.kind,
            username = %user.username,
            email = %user.email,
            verify_url = %link,
            "Processed task"
        );
        Ok(record)
    }
}

#[async_trait]
impl<B: TxBackend> TaskProcessor for VerifyEmailProcessor<B> {
    async fn process_task(&self, _ctx: &OpContext, task: &Task) -> Result<(), ProcessError> {
        match task.kind.as_str() {
            TASK_SEND_VERIFY_EMAIL => self.process_task_send_verify_email(task).await.map(|_| ()),
            other => Err(ProcessError::SkipRetry(anyhow::anyhow!("unknown task kind {other}"))),
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_RETRY_DELAY_SECS))
}

/// Consume `queue` until it closes or `ctx` is done; each task runs on its own
/// tokio task with its delay and retries
pub async fn run_worker<P>(mut queue: TaskQueue, processor: Arc<P>, ctx: OpContext)
where
    P: TaskProcessor + 'static,
{
    info!("Task worker started");
    loop {
        let task = tokio::select! {
            task = queue.recv() => task,
            _ = ctx.done() => None,
        };
        let Some(task) = task else { break };
        tokio::spawn(run_task(processor.clone(), ctx.child(), task));
    }
    info!("Task worker stopped");
}

async fn run_task<P: TaskProcessor>(processor: Arc<P>, ctx: OpContext, task: Task) {
    let mut delay = task.options.process_in;
    let mut attempt = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.done() => return,
        }

        match processor.process_task(&ctx, &task).await {
            Ok(()) => return,
            Err(ProcessError::SkipRetry(e)) => {
                error!(kind = %task.kind, error = %e, "Task failed, not retrying");
                return;
            }
            Err(ProcessError::Retry(e)) if attempt >= task.options.max_retry => {
                error!(kind = %task.kind, error = %e, attempt, "Task failed, retries exhausted");
                return;
            }
            Err(ProcessError::Retry(e)) => {
                attempt += 1;
                delay = retry_delay(attempt);
                warn!(kind = %task.kind, error = %e, attempt, "Task failed, retrying");
            }
        }
    }
}
