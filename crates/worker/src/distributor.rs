//! Task queue client traits and the in-memory queue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::task::{
    PayloadSendVerifyEmail, QueuedTask, TASK_SEND_VERIFY_EMAIL, Task, TaskError, TaskInfo, TaskOptions,
};

/// Producer side of the task queue.
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn enqueue(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, TaskError>;

    async fn distribute_task_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, TaskError> {
        let task = Task::new(TASK_SEND_VERIFY_EMAIL, payload)?;
        let info = self.enqueue(task, opts).await?;
        debug!(task_id = %info.id, queue = %info.queue, "enqueued send_verify_email");
        Ok(info)
    }
}

/// Consumer side of the task queue.
#[async_trait]
pub trait TaskQueue: TaskDistributor {
    /// Take the oldest ready task, checking `queues` in order.
    async fn dequeue(&self, queues: &[&str]) -> Result<Option<QueuedTask>, TaskError>;

    /// Acknowledge a task that was handled successfully.
    async fn complete(&self, task: &QueuedTask) -> Result<(), TaskError>;

    /// Put a failed task back, visible again after `delay`.
    async fn retry(&self, task: QueuedTask, error: String, delay: Duration) -> Result<(), TaskError>;

    /// Park a task that will not be attempted again.
    async fn archive(&self, task: QueuedTask, error: String) -> Result<(), TaskError>;
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<String, Vec<QueuedTask>>,
    archived: Vec<QueuedTask>,
}

/// In-memory task queue.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    unavailable: AtomicBool,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the broker: every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Tasks still waiting in `queue` (ready or not).
    pub fn pending(&self, queue: &str) -> Vec<QueuedTask> {
        self.state
            .lock()
            .map(|s| s.queues.get(queue).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn archived(&self) -> Vec<QueuedTask> {
        self.state.lock().map(|s| s.archived.clone()).unwrap_or_default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, TaskError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TaskError::Connection("in-memory queue unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| TaskError::Command("queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskDistributor for InMemoryTaskQueue {
    #[instrument(skip(self, task), fields(task_type = %task.task_type, queue = %opts.queue), err)]
    async fn enqueue(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, TaskError> {
        let queued = QueuedTask::new(task, &opts);
        let info = queued.info();
        self.state()?.queues.entry(opts.queue).or_default().push(queued);
        Ok(info)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn dequeue(&self, queues: &[&str]) -> Result<Option<QueuedTask>, TaskError> {
        let now = Utc::now();
        let mut state = self.state()?;
        for name in queues {
            let Some(queue) = state.queues.get_mut(*name) else {
                continue;
            };
            let ready = queue
                .iter()
                .enumerate()
                .filter(|(_, t)| t.is_ready(now))
                .min_by_key(|(_, t)| t.process_at)
                .map(|(idx, _)| idx);
            if let Some(idx) = ready {
                return Ok(Some(queue.remove(idx)));
            }
        }
        Ok(None)
    }

    async fn complete(&self, _task: &QueuedTask) -> Result<(), TaskError> {
        // Dequeue already removed it.
        self.state().map(|_| ())
    }

    async fn retry(&self, mut task: QueuedTask, error: String, delay: Duration) -> Result<(), TaskError> {
        task.retried += 1;
        task.last_error = Some(error);
        task.process_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.state()?.queues.entry(task.queue.clone()).or_default().push(task);
        Ok(())
    }

    async fn archive(&self, mut task: QueuedTask, error: String) -> Result<(), TaskError> {
        task.last_error = Some(error);
        self.state()?.archived.push(task);
        Ok(())
    }
}
