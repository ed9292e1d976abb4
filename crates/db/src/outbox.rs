//! Transactional outbox.
//!
//! A workflow that must trigger work in an external system writes an
//! [`OutboxMessage`] through the same unit of work as its business rows. A
//! relay (see the worker crate) later hands pending messages to the task
//! queue, so the external enqueue never has to be atomic with the commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::params::CreateOutboxMessageParams;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub max_retry: i32,
    pub process_in_secs: i64,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn is_pending(&self) -> bool {
        self.dispatched_at.is_none()
    }
}

impl CreateOutboxMessageParams {
    /// Build an outbox message carrying a serializable task payload.
    pub fn for_task<P: Serialize>(
        task_type: impl Into<String>,
        payload: &P,
        queue: impl Into<String>,
        max_retry: i32,
        process_in_secs: i64,
    ) -> StoreResult<Self> {
        Ok(Self {
            task_type: task_type.into(),
            payload: serde_json::to_value(payload)?,
            queue: queue.into(),
            max_retry,
            process_in_secs,
        })
    }
}
