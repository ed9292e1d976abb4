//! Outbox relay: moves committed outbox rows onto the task queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use simplebank_db::{Database, Querier, StoreError, StoreResult, TxOptions, exec_tx};

use crate::distributor::TaskDistributor;
use crate::handle::{WorkerHandle, spawn_loop};
use crate::task;

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll when the outbox is empty
    pub poll_interval: Duration,
    /// Messages claimed per unit of work
    pub batch_size: i64,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            name: "outbox-relay".to_string(),
            poll_interval: Duration::from_millis(500),
            batch_size: 32,
        }
    }
}

impl OutboxRelayConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Delivers outbox messages at least once.
///
/// Each batch is claimed, enqueued and marked dispatched inside one unit of
/// work. If an enqueue fails the unit rolls back and the whole batch stays
/// pending, so messages enqueued before the failure will be enqueued again.
pub struct OutboxRelay {
    db: Arc<dyn Database>,
    distributor: Arc<dyn TaskDistributor>,
    config: OutboxRelayConfig,
}

impl OutboxRelay {
    pub fn new(db: Arc<dyn Database>, distributor: Arc<dyn TaskDistributor>) -> Self {
        Self {
            db,
            distributor,
            config: OutboxRelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OutboxRelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Relay one batch. Returns how many messages were dispatched.
    pub async fn relay_once(&self) -> StoreResult<usize> {
        let distributor = self.distributor.clone();
        let batch_size = self.config.batch_size;

        exec_tx(self.db.as_ref(), &TxOptions::labeled("outbox_relay"), move |q| {
            Box::pin(async move {
                let batch = q.claim_outbox_messages(batch_size).await?;
                for message in &batch {
                    let (task, opts) = task::from_outbox(message);
                    let info = distributor
                        .enqueue(task, opts)
                        .await
                        .map_err(|e| StoreError::hook(format!("enqueue of outbox message {}: {e}", message.id)))?;
                    q.mark_outbox_dispatched(message.id).await?;
                    debug!(outbox_id = message.id, task_id = %info.id, queue = %info.queue, "outbox message relayed");
                }
                Ok(batch.len())
            })
        })
        .await
    }

    /// Poll the outbox in a background task until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let name = self.config.name.clone();
        let poll_interval = self.config.poll_interval;
        let this = Arc::new(self);

        spawn_loop(name, poll_interval, move || {
            let this = this.clone();
            Box::pin(async move {
                match this.relay_once().await {
                    Ok(0) => false,
                    Ok(n) => {
                        info!(relay = %this.config.name, dispatched = n, "outbox batch relayed");
                        true
                    }
                    Err(e) => {
                        error!(relay = %this.config.name, error = %e, "outbox relay failed");
                        false
                    }
                }
            })
        })
    }
}
