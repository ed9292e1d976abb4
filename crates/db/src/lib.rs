//! Persistence for the ledger.
//!
//! - [`Querier`]: primitive single-row queries, bound to one connection
//! - [`exec_tx`]: runs a closure inside one unit of work (all or nothing)
//! - [`Store`]: the composite workflows (`transfer_tx`, `create_user_tx`, `verify_email_tx`)
//! - backends: [`MemoryDatabase`] for tests/dev, [`PgDatabase`] for Postgres

pub mod error;
pub mod memory;
pub mod outbox;
pub mod params;
pub mod postgres;
pub mod querier;
pub mod store;
pub mod transfer;
pub mod unit_of_work;
pub mod user;

pub use error::{ErrorKind, StoreError, StoreResult};
pub use memory::{MemoryDatabase, QueryOp};
pub use outbox::OutboxMessage;
pub use params::*;
pub use postgres::{PgDatabase, PgQueries};
pub use querier::Querier;
pub use store::{SqlStore, Store};
pub use transfer::{TransferTxParams, TransferTxResult};
pub use unit_of_work::{BoxFuture, Database, Transaction, TxOptions, exec_tx};
pub use user::{
    AfterCreate, CreateUserTxParams, CreateUserTxResult, VerifyEmailTxParams, VerifyEmailTxResult,
};
