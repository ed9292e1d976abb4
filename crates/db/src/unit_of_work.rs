//! Unit-of-work executor.
//!
//! A unit of work groups several `Querier` calls into one transactional
//! scope: either every mutation made through the scope becomes durable, or
//! none of them does.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{Instrument, debug, error, info_span};

use crate::error::{StoreError, StoreResult};
use crate::querier::Querier;

/// Boxed, sendable future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A transactional scope bound to one connection.
///
/// Dropping a `Transaction` without committing discards its writes.
#[async_trait]
pub trait Transaction: Querier {
    /// The scope viewed as a plain querier.
    fn querier(&mut self) -> &mut dyn Querier;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// The underlying store: hands out transactional scopes and autocommit
/// connections.
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a new transactional scope.
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Acquire a connection in which every call commits on its own.
    async fn connect(&self) -> StoreResult<Box<dyn Querier>>;
}

/// Per-unit execution options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Diagnostic name recorded on the unit's span.
    pub label: Option<String>,
    /// Upper bound for the whole unit; on expiry the unit is rolled back.
    pub timeout: Option<Duration>,
}

impl TxOptions {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Run `f` inside one unit of work.
///
/// - If the scope cannot be opened, `f` is not invoked and the open error is returned.
/// - If `f` succeeds the scope is committed; a commit failure is returned.
/// - If `f` fails (or the unit times out) the scope is rolled back and the
///   error from `f` is returned. A rollback failure is logged and never
///   replaces it.
pub async fn exec_tx<D, F, T>(db: &D, options: &TxOptions, f: F) -> StoreResult<T>
where
    D: Database + ?Sized,
    F: for<'c> FnOnce(&'c mut dyn Querier) -> BoxFuture<'c, StoreResult<T>> + Send,
    T: Send,
{
    let span = info_span!(
        "unit_of_work",
        label = options.label.as_deref().unwrap_or("anonymous"),
    );

    async move {
        let mut tx = db.begin().await?;
        debug!("scope opened");

        let outcome = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, f(tx.querier())).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(limit)),
            },
            None => f(tx.querier()).await,
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                debug!("scope committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %err, rollback_error = %rollback_err, "rollback failed");
                } else {
                    debug!(error = %err, "scope rolled back");
                }
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}
