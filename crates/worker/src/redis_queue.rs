//! Redis-backed task queue.
//!
//! ## Layout
//!
//! - **Queue key**: `simplebank:queue:{name}`, a sorted set of JSON-encoded
//!   [`QueuedTask`]s scored by `process_at` in unix milliseconds
//! - **In-flight key**: `simplebank:inflight:{name}`, the members currently
//!   leased to a worker, scored by lease deadline
//! - **Archive key**: `simplebank:archived`, a list of tasks that ran out of
//!   retries or could not be decoded
//!
//! Claiming moves a ready member from its queue into the in-flight set in one
//! script call. The member leaves the in-flight set only when the worker
//! completes, retries or archives it. A lease that expires first (the worker
//! died) is moved back onto its queue by the next claim, so delivery is
//! at-least-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument, warn};

use crate::distributor::{TaskDistributor, TaskQueue};
use crate::task::{QueuedTask, Task, TaskError, TaskInfo, TaskOptions};

const KEY_PREFIX: &str = "simplebank:queue";
const INFLIGHT_PREFIX: &str = "simplebank:inflight";
const ARCHIVE_KEY: &str = "simplebank:archived";

pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// KEYS: queue, in-flight. ARGV: now ms, lease deadline ms.
/// Returns the leased member, or nil when nothing is ready.
const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(expired) do
  redis.call('ZREM', KEYS[2], member)
  redis.call('ZADD', KEYS[1], ARGV[1], member)
end
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
local member = ready[1]
if not member then
  return false
end
redis.call('ZREM', KEYS[1], member)
redis.call('ZADD', KEYS[2], ARGV[2], member)
return member
"#;

#[derive(Debug, Clone)]
pub struct RedisTaskDistributor {
    client: Arc<redis::Client>,
    claim: redis::Script,
    lease: Duration,
}

impl RedisTaskDistributor {
    /// `redis_url` e.g. "redis://localhost:6379".
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, TaskError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TaskError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            claim: redis::Script::new(CLAIM_SCRIPT),
            lease: DEFAULT_LEASE,
        })
    }

    /// How long a claimed task may run before another worker may take it.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, TaskError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TaskError::Connection(e.to_string()))
    }

    fn queue_key(queue: &str) -> String {
        format!("{KEY_PREFIX}:{queue}")
    }

    fn inflight_key(queue: &str) -> String {
        format!("{INFLIGHT_PREFIX}:{queue}")
    }

    fn lease_deadline(&self, now_ms: i64) -> i64 {
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(lease_ms)
    }

    async fn claim_one(&self, conn: &mut MultiplexedConnection, queue: &str) -> Result<Option<String>, TaskError> {
        let now = Utc::now().timestamp_millis();
        self.claim
            .key(Self::queue_key(queue))
            .key(Self::inflight_key(queue))
            .arg(now)
            .arg(self.lease_deadline(now))
            .invoke_async(conn)
            .await
            .map_err(|e| TaskError::Command(e.to_string()))
    }

    /// Drop the lease (if any) and push `member` onto the queue or the archive, atomically.
    async fn settle(
        &self,
        task: &QueuedTask,
        member: String,
        destination: Destination,
    ) -> Result<(), TaskError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(claimed) = &task.claim {
            pipe.cmd("ZREM").arg(Self::inflight_key(&task.queue)).arg(claimed).ignore();
        }
        match destination {
            Destination::Queue => {
                pipe.cmd("ZADD")
                    .arg(Self::queue_key(&task.queue))
                    .arg(task.process_at.timestamp_millis())
                    .arg(member)
                    .ignore();
            }
            Destination::Archive => {
                pipe.cmd("LPUSH").arg(ARCHIVE_KEY).arg(member).ignore();
            }
        }

        let mut conn = self.connection().await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::Command(e.to_string()))?;
        Ok(())
    }

    async fn archive_undecodable(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        member: &str,
    ) -> Result<(), TaskError> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(Self::inflight_key(queue))
            .arg(member)
            .ignore()
            .cmd("LPUSH")
            .arg(ARCHIVE_KEY)
            .arg(member)
            .ignore()
            .query_async(conn)
            .await
            .map_err(|e| TaskError::Command(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Destination {
    Queue,
    Archive,
}

#[async_trait]
impl TaskDistributor for RedisTaskDistributor {
    #[instrument(skip(self, task), fields(task_type = %task.task_type, queue = %opts.queue), err)]
    async fn enqueue(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, TaskError> {
        let queued = QueuedTask::new(task, &opts);
        let member = serde_json::to_string(&queued)?;
        self.settle(&queued, member, Destination::Queue).await?;
        Ok(queued.info())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskDistributor {
    async fn dequeue(&self, queues: &[&str]) -> Result<Option<QueuedTask>, TaskError> {
        let mut conn = self.connection().await?;

        for queue in queues {
            while let Some(member) = self.claim_one(&mut conn, queue).await? {
                match serde_json::from_str::<QueuedTask>(&member) {
                    Ok(mut task) => {
                        debug!(queue = %queue, task_id = %task.id, "leased task");
                        task.claim = Some(member);
                        return Ok(Some(task));
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "archiving undecodable task");
                        self.archive_undecodable(&mut conn, queue, &member).await?;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), TaskError> {
        let Some(claimed) = &task.claim else {
            return Ok(());
        };
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZREM")
            .arg(Self::inflight_key(&task.queue))
            .arg(claimed)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::Command(e.to_string()))?;
        Ok(())
    }

    async fn retry(&self, mut task: QueuedTask, error: String, delay: Duration) -> Result<(), TaskError> {
        task.retried += 1;
        task.last_error = Some(error);
        task.process_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let member = serde_json::to_string(&task)?;
        self.settle(&task, member, Destination::Queue).await
    }

    async fn archive(&self, mut task: QueuedTask, error: String) -> Result<(), TaskError> {
        task.last_error = Some(error);
        let member = serde_json::to_string(&task)?;
        self.settle(&task, member, Destination::Archive).await
    }
}
