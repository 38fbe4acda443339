use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::info;

use super::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, Task, TaskError, TaskOptions};
use crate::context::OpContext;
use crate::ledger::AfterCreateHook;

#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute_task(&self, ctx: &OpContext, task: Task) -> Result<(), TaskError>;

    async fn distribute_task_send_verify_email(
        &self,
        ctx: &OpContext,
        payload: &PayloadSendVerifyEmail,
        options: TaskOptions,
    ) -> Result<(), TaskError> {
        let task = Task::new(TASK_SEND_VERIFY_EMAIL, payload, options)?;
        self.distribute_task(ctx, task).await
    }
}

/// Receiving end of a [`ChannelTaskDistributor`]
pub struct TaskQueue {
    receiver: mpsc::Receiver<Task>,
}

impl TaskQueue {
    pub async fn recv(&mut self) -> Option<Task> {
        self.receiver.recv().await
    }
}

#[derive(Clone)]
pub struct ChannelTaskDistributor {
    sender: mpsc::Sender<Task>,
}

impl ChannelTaskDistributor {
    /// Bounded in-process queue; enqueue waits while it is full
    pub fn channel(capacity: usize) -> (Self, TaskQueue) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, TaskQueue { receiver })
    }
}

#[async_trait]
impl TaskDistributor for ChannelTaskDistributor {
    async fn distribute_task(&self, ctx: &OpContext, task: Task) -> Result<(), TaskError> {
        let kind = task.kind.clone();
        let queue = task.options.queue.clone();
        let max_retry = task.options.max_retry;

        tokio::select! {
            sent = self.sender.send(task) => sent.map_err(|_| TaskError::QueueClosed)?,
            _ = ctx.done() => return Err(TaskError::Cancelled),
        }

        info!(kind = %kind, queue = %queue, max_retry, "Enqueued task");
        Ok(())
    }
}

/// After-create hook that schedules the verification email for the new user
pub fn verify_email_hook(
    distributor: Arc<dyn TaskDistributor>,
    ctx: OpContext,
    options: TaskOptions,
) -> AfterCreateHook {
    Box::new(move |user: crate::store::models::User| {
        async move {
            let payload = PayloadSendVerifyEmail {
                username: user.username,
            };
            distributor
                .distribute_task_send_verify_email(&ctx, &payload, options)
                .await?;
            Ok(())
        }
        .boxed()
    })
}
