//! Task types, payloads and enqueue options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use simplebank_db::OutboxMessage;

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

/// Queues in the order workers drain them.
pub const QUEUES_BY_PRIORITY: [&str; 2] = [QUEUE_CRITICAL, QUEUE_DEFAULT];

/// Errors raised while talking to the task queue.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task queue connection error: {0}")]
    Connection(String),

    #[error("task queue command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_type: String,
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new<P: Serialize>(task_type: impl Into<String>, payload: &P) -> Result<Self, TaskError> {
        Ok(Self {
            task_type: task_type.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Attempts allowed after the first failure.
    pub max_retry: u32,
    /// Delay before the task becomes visible to workers.
    pub process_in: Duration,
    pub queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: 25,
            process_in: Duration::ZERO,
            queue: QUEUE_DEFAULT.to_string(),
        }
    }
}

impl TaskOptions {
    /// Options used when a new user's verification email is queued.
    pub fn verify_email() -> Self {
        Self {
            max_retry: 10,
            process_in: Duration::from_secs(10),
            queue: QUEUE_CRITICAL.to_string(),
        }
    }
}

/// Receipt for an enqueued task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub task_type: String,
    pub queue: String,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
}

/// A task as held by a queue, with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub max_retry: u32,
    /// Failed attempts so far.
    pub retried: u32,
    pub process_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Encoded member a broker leased this delivery under, if any.
    #[serde(skip)]
    pub(crate) claim: Option<String>,
}

impl QueuedTask {
    pub fn new(task: Task, opts: &TaskOptions) -> Self {
        let delay = chrono::Duration::from_std(opts.process_in).unwrap_or_default();
        Self {
            id: Uuid::now_v7(),
            task_type: task.task_type,
            payload: task.payload,
            queue: opts.queue.clone(),
            max_retry: opts.max_retry,
            retried: 0,
            process_at: Utc::now() + delay,
            last_error: None,
            claim: None,
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            task_type: self.task_type.clone(),
            queue: self.queue.clone(),
            max_retry: self.max_retry,
            process_at: self.process_at,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.process_at <= now
    }

    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }
}

/// Turn a committed outbox row back into an enqueue request.
pub fn from_outbox(message: &OutboxMessage) -> (Task, TaskOptions) {
    let task = Task {
        task_type: message.task_type.clone(),
        payload: message.payload.clone(),
    };
    let opts = TaskOptions {
        max_retry: message.max_retry.max(0) as u32,
        process_in: Duration::from_secs(message.process_in_secs.max(0) as u64),
        queue: message.queue.clone(),
    };
    (task, opts)
}
