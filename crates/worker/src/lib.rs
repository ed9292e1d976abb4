//! Background work for the bank: the task queue, its processor and the
//! outbox relay that feeds it.

pub mod distributor;
pub mod email;
pub mod handle;
pub mod hooks;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod relay;
pub mod retry;
pub mod task;

pub use distributor::{InMemoryTaskQueue, TaskDistributor, TaskQueue};
pub use email::{EmailError, EmailMessage, EmailSender, LogEmailSender, MemoryEmailSender};
pub use handle::WorkerHandle;
pub use hooks::{verify_email_via_outbox, verify_email_via_queue};
pub use processor::{HandlerError, Processed, ProcessorConfig, TaskProcessor};
#[cfg(feature = "redis")]
pub use redis_queue::RedisTaskDistributor;
pub use relay::{OutboxRelay, OutboxRelayConfig};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use task::{
    PayloadSendVerifyEmail, QUEUE_CRITICAL, QUEUE_DEFAULT, QueuedTask, TASK_SEND_VERIFY_EMAIL, Task,
    TaskError, TaskInfo, TaskOptions,
};
