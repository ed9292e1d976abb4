//! Background polling loops and their shutdown handles.

use std::time::Duration;

use simplebank_db::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to a running background loop.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the current iteration to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(worker = %self.name, error = %e, "worker task ended abnormally");
        }
    }
}

/// Run `tick` until shutdown. A tick returning `true` found work, so the
/// next one starts immediately; otherwise the loop sleeps `poll_interval`.
pub(crate) fn spawn_loop<F>(name: String, poll_interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> BoxFuture<'static, bool> + Send + 'static,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let worker = name.clone();

    let join = tokio::spawn(async move {
        info!(worker = %worker, "worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if tick().await {
                continue;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!(worker = %worker, "worker stopped");
    });

    WorkerHandle {
        name,
        shutdown,
        join,
    }
}
