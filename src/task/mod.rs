//! Background tasks
//!
//! Registration hands the verification email off to a queue instead of
//! sending it inline:
//! - [`TaskDistributor`]: enqueue side, used from the after-create hook
//! - [`TaskProcessor`]: consume side, run by [`run_worker`]
//! - [`ChannelTaskDistributor`]: in-process queue on a tokio channel

pub mod distributor;
pub mod processor;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::VerifyEmailConfig;

pub use distributor::{ChannelTaskDistributor, TaskDistributor, TaskQueue, verify_email_hook};
pub use processor::{ProcessError, TaskProcessor, VerifyEmailProcessor, run_worker};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub max_retry: u32,
    /// Delay before the first attempt
    pub process_in: Duration,
    pub queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: 10,
            process_in: Duration::from_secs(10),
            queue: QUEUE_CRITICAL.to_string(),
        }
    }
}

impl From<&VerifyEmailConfig> for TaskOptions {
    fn from(config: &VerifyEmailConfig) -> Self {
        Self {
            max_retry: config.max_retry,
            process_in: Duration::from_secs(config.process_in_secs),
            queue: config.queue.clone(),
        }
    }
}

/// A queued unit of background work with a JSON payload
#[derive(Debug, Clone)]
pub struct Task {
    pub kind: String,
    pub payload: Vec<u8>,
    pub options: TaskOptions,
}

impl Task {
    pub fn new<P: Serialize>(kind: &str, payload: &P, options: TaskOptions) -> Result<Self, TaskError> {
        Ok(Self {
            kind: kind.to_string(),
            payload: serde_json::to_vec(payload).map_err(TaskError::Encode)?,
            options,
        })
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("failed to marshal task payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("task queue is closed")]
    QueueClosed,

    #[error("enqueue cancelled")]
    Cancelled,
}
