//! The store: primitive queries plus the composite ledger workflows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use simplebank_core::Transfer;

use crate::error::StoreResult;
use crate::querier::Querier;
use crate::transfer::{self, TransferTxParams, TransferTxResult};
use crate::unit_of_work::{Database, TxOptions, exec_tx};
use crate::user::{self, CreateUserTxParams, CreateUserTxResult, VerifyEmailTxParams, VerifyEmailTxResult};

/// Everything the service layer needs from persistence.
///
/// Each workflow method runs in its own unit of work: it either fully
/// applies or leaves no trace.
#[async_trait]
pub trait Store: Send + Sync {
    /// An autocommit connection for single primitive queries.
    async fn conn(&self) -> StoreResult<Box<dyn Querier>>;

    async fn transfer_tx(&self, arg: TransferTxParams) -> StoreResult<TransferTxResult>;

    async fn create_user_tx(&self, arg: CreateUserTxParams) -> StoreResult<CreateUserTxResult>;

    async fn verify_email_tx(&self, arg: VerifyEmailTxParams) -> StoreResult<VerifyEmailTxResult>;
}

/// [`Store`] over any [`Database`] backend.
#[derive(Clone)]
pub struct SqlStore {
    db: Arc<dyn Database>,
    tx_timeout: Option<Duration>,
}

impl SqlStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, tx_timeout: None }
    }

    /// Bound every workflow unit by `timeout`.
    pub fn with_tx_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    fn options(&self, label: &str) -> TxOptions {
        TxOptions::labeled(label).with_timeout(self.tx_timeout)
    }
}

impl core::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SqlStore")
            .field("tx_timeout", &self.tx_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn conn(&self) -> StoreResult<Box<dyn Querier>> {
        self.db.connect().await
    }

    #[instrument(
        skip(self),
        fields(from = %arg.from_account_id, to = %arg.to_account_id, amount = arg.amount),
        err
    )]
    async fn transfer_tx(&self, arg: TransferTxParams) -> StoreResult<TransferTxResult> {
        Transfer::validate_request(arg.from_account_id, arg.to_account_id, arg.amount)?;

        exec_tx(self.db.as_ref(), &self.options("transfer_tx"), move |q| {
            Box::pin(transfer::transfer(q, arg))
        })
        .await
    }

    #[instrument(skip(self, arg), fields(username = %arg.params.username), err)]
    async fn create_user_tx(&self, arg: CreateUserTxParams) -> StoreResult<CreateUserTxResult> {
        exec_tx(self.db.as_ref(), &self.options("create_user_tx"), move |q| {
            Box::pin(user::create_user(q, arg))
        })
        .await
    }

    #[instrument(skip(self, arg), fields(email_id = %arg.email_id), err)]
    async fn verify_email_tx(&self, arg: VerifyEmailTxParams) -> StoreResult<VerifyEmailTxResult> {
        exec_tx(self.db.as_ref(), &self.options("verify_email_tx"), move |q| {
            Box::pin(user::verify_email(q, arg))
        })
        .await
    }
}
