use std::sync::Arc;
use std::time::Duration;

use simplebank_db::{Database, MemoryDatabase, PgDatabase, SqlStore, Store, StoreResult};
use simplebank_worker::{
    EmailSender, InMemoryTaskQueue, LogEmailSender, OutboxRelay, OutboxRelayConfig, ProcessorConfig,
    RedisTaskDistributor, TaskDistributor, TaskProcessor, TaskQueue, WorkerHandle,
};

use crate::config::AppConfig;

/// Which storage stack the services run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Persistent,
}

/// Everything the handlers and the background workers share.
#[derive(Clone)]
pub struct AppServices {
    backend: Backend,
    db: Arc<dyn Database>,
    store: Arc<dyn Store>,
    distributor: Arc<dyn TaskDistributor>,
    queue: Arc<dyn TaskQueue>,
    mailer: Arc<dyn EmailSender>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl AppServices {
    /// In-memory wiring (dev/test): memory database, in-process queue, logged emails.
    pub fn in_memory(tx_timeout: Option<Duration>) -> Self {
        Self::in_memory_with_mailer(Arc::new(LogEmailSender), tx_timeout)
    }

    pub fn in_memory_with_mailer(mailer: Arc<dyn EmailSender>, tx_timeout: Option<Duration>) -> Self {
        let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        Self {
            backend: Backend::InMemory,
            store: Arc::new(SqlStore::new(db.clone()).with_tx_timeout(tx_timeout)),
            db,
            distributor: queue.clone(),
            queue,
            mailer,
        }
    }

    /// Postgres + Redis wiring. Runs pending migrations before returning.
    pub async fn persistent(config: &AppConfig) -> anyhow::Result<Self> {
        let pg = PgDatabase::open(&config.database_url, config.db_max_connections).await?;
        pg.migrate().await?;
        let db: Arc<dyn Database> = Arc::new(pg);
        let redis = Arc::new(RedisTaskDistributor::new(&config.redis_url)?);

        Ok(Self {
            backend: Backend::Persistent,
            store: Arc::new(SqlStore::new(db.clone()).with_tx_timeout(config.tx_timeout)),
            db,
            distributor: redis.clone(),
            queue: redis,
            mailer: Arc::new(LogEmailSender),
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Cheap round trip to the store, used by the health check.
    pub async fn ping(&self) -> StoreResult<()> {
        self.store.conn().await.map(|_| ())
    }

    /// Start the outbox relay and the task processor.
    pub fn spawn_workers(&self, poll_interval: Duration) -> Vec<WorkerHandle> {
        let relay = OutboxRelay::new(self.db.clone(), self.distributor.clone())
            .with_config(OutboxRelayConfig::default().with_poll_interval(poll_interval));
        let processor = TaskProcessor::new(self.store.clone(), self.queue.clone(), self.mailer.clone())
            .with_config(ProcessorConfig::default().with_poll_interval(poll_interval));

        vec![relay.spawn(), processor.spawn()]
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    if config.use_persistent_stores {
        tracing::info!("using Postgres and Redis stores");
        return AppServices::persistent(config).await;
    }

    tracing::info!("using in-memory stores");
    Ok(AppServices::in_memory(config.tx_timeout))
}
