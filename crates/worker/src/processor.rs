//! Task processor: drains the queue and runs task handlers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, error, info, instrument, warn};

use simplebank_db::{CreateVerifyEmailParams, Querier, Store};

use crate::distributor::TaskQueue;
use crate::email::{EmailMessage, EmailSender};
use crate::handle::{WorkerHandle, spawn_loop};
use crate::retry::RetryPolicy;
use crate::task::{PayloadSendVerifyEmail, QUEUES_BY_PRIORITY, QueuedTask, TASK_SEND_VERIFY_EMAIL, TaskError};

const SECRET_CODE_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll an empty queue
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Lifetime of a verification code
    pub verify_email_ttl: chrono::Duration,
    /// Link target for verification emails; id and code are appended as query parameters.
    pub verify_url: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
            poll_interval: Duration::from_millis(200),
            retry: RetryPolicy::default(),
            verify_email_ttl: chrono::Duration::minutes(15),
            verify_url: "http://localhost:8080/verify_email".to_string(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Why a handler failed.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retrying cannot help (bad payload, missing user).
    #[error("{0}")]
    Skip(String),

    #[error("{0}")]
    Retry(String),
}

/// What happened to the task taken by one [`TaskProcessor::process_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Idle,
    Completed,
    Retrying,
    Archived,
}

pub struct TaskProcessor {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    mailer: Arc<dyn EmailSender>,
    config: ProcessorConfig,
}

impl TaskProcessor {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn TaskQueue>, mailer: Arc<dyn EmailSender>) -> Self {
        Self {
            store,
            queue,
            mailer,
            config: ProcessorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Take one ready task and run it, rescheduling or archiving it on failure.
    pub async fn process_next(&self) -> Result<Processed, TaskError> {
        let Some(task) = self.queue.dequeue(&QUEUES_BY_PRIORITY).await? else {
            return Ok(Processed::Idle);
        };

        debug!(processor = %self.config.name, task_id = %task.id, task_type = %task.task_type, "claimed task");

        match self.handle(&task).await {
            Ok(()) => {
                self.queue.complete(&task).await?;
                info!(task_id = %task.id, task_type = %task.task_type, "task completed");
                Ok(Processed::Completed)
            }
            Err(HandlerError::Retry(err)) if task.can_retry() => {
                let delay = self.config.retry.delay_for_attempt(task.retried + 1);
                warn!(
                    task_id = %task.id,
                    attempt = task.retried + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "task failed, will retry"
                );
                self.queue.retry(task, err, delay).await?;
                Ok(Processed::Retrying)
            }
            Err(err) => {
                error!(task_id = %task.id, task_type = %task.task_type, error = %err, "task archived");
                self.queue.archive(task, err.to_string()).await?;
                Ok(Processed::Archived)
            }
        }
    }

    pub async fn handle(&self, task: &QueuedTask) -> Result<(), HandlerError> {
        match task.task_type.as_str() {
            TASK_SEND_VERIFY_EMAIL => {
                let payload: PayloadSendVerifyEmail = serde_json::from_value(task.payload.clone())
                    .map_err(|e| HandlerError::Skip(format!("failed to decode payload: {e}")))?;
                self.send_verify_email(payload).await
            }
            other => Err(HandlerError::Skip(format!("no handler for task type: {other}"))),
        }
    }

    #[instrument(skip(self, payload), fields(username = %payload.username), err)]
    async fn send_verify_email(&self, payload: PayloadSendVerifyEmail) -> Result<(), HandlerError> {
        let mut conn = self
            .store
            .conn()
            .await
            .map_err(|e| HandlerError::Retry(e.to_string()))?;

        let user = conn.get_user(&payload.username).await.map_err(|e| {
            if e.is_not_found() {
                HandlerError::Skip(format!("user doesn't exist: {}", payload.username))
            } else {
                HandlerError::Retry(format!("failed to get user: {e}"))
            }
        })?;

        let verify_email = conn
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: random_code(SECRET_CODE_LEN),
                expired_at: Utc::now() + self.config.verify_email_ttl,
            })
            .await
            .map_err(|e| HandlerError::Retry(format!("failed to create verify email: {e}")))?;

        let link = format!(
            "{}?email_id={}&secret_code={}",
            self.config.verify_url, verify_email.id, verify_email.secret_code
        );
        let message = EmailMessage {
            to: user.email.clone(),
            subject: "Welcome to Simple Bank".to_string(),
            body: format!(
                "Hello {} {},<br/>Thanks for registering.<br/>\
                 Please <a href=\"{link}\">verify your email address</a>.",
                user.first_name, user.last_name
            ),
        };

        self.mailer
            .send(message)
            .await
            .map_err(|e| HandlerError::Retry(e.to_string()))?;

        debug!(email = %user.email, email_id = %verify_email.id, "verification email sent");
        Ok(())
    }

    /// Poll the queue in a background task until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let name = self.config.name.clone();
        let poll_interval = self.config.poll_interval;
        let this = Arc::new(self);

        spawn_loop(name, poll_interval, move || {
            let this = this.clone();
            Box::pin(async move {
                match this.process_next().await {
                    Ok(Processed::Idle) => false,
                    Ok(_) => true,
                    Err(e) => {
                        error!(processor = %this.config.name, error = %e, "failed to take task");
                        false
                    }
                }
            })
        })
    }
}

fn random_code(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
