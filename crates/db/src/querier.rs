//! Primitive point-query capability.

use async_trait::async_trait;
use uuid::Uuid;

use simplebank_core::{
    Account, AccountId, Entry, EntryId, Session, Transfer, TransferId, User, VerifyEmail,
    VerifyEmailId,
};

use crate::error::StoreResult;
use crate::outbox::OutboxMessage;
use crate::params::*;

/// Single-row create/get/update/delete/list operations over the ledger tables.
///
/// A `Querier` is always bound to one connection: either a transactional
/// scope opened by the unit-of-work executor, or an autocommit connection in
/// which every call is its own unit. Methods take `&mut self` because a
/// connection serves one statement at a time.
///
/// Missing rows are reported as [`StoreError::NotFound`](crate::StoreError::NotFound).
#[async_trait]
pub trait Querier: Send {
    // accounts
    async fn create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account>;
    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account>;
    /// Read an account and hold its row lock until the unit ends.
    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account>;
    async fn list_accounts(&mut self, arg: ListAccountsParams) -> StoreResult<Vec<Account>>;
    async fn update_account(&mut self, arg: UpdateAccountParams) -> StoreResult<Account>;
    /// Atomically add `amount` to the balance, locking the row.
    async fn add_account_balance(&mut self, arg: AddAccountBalanceParams) -> StoreResult<Account>;
    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()>;

    // entries
    async fn create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry>;
    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry>;
    async fn list_entries(&mut self, arg: ListEntriesParams) -> StoreResult<Vec<Entry>>;
    async fn delete_entry(&mut self, id: EntryId) -> StoreResult<()>;

    // transfers
    async fn create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer>;
    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer>;
    async fn list_transfers(&mut self, arg: ListTransfersParams) -> StoreResult<Vec<Transfer>>;
    async fn delete_transfer(&mut self, id: TransferId) -> StoreResult<()>;

    // users
    async fn create_user(&mut self, arg: CreateUserParams) -> StoreResult<User>;
    async fn get_user(&mut self, username: &str) -> StoreResult<User>;
    async fn update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User>;
    async fn delete_user(&mut self, username: &str) -> StoreResult<()>;

    // sessions
    async fn create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session>;
    async fn get_session(&mut self, id: Uuid) -> StoreResult<Session>;

    // email verification
    async fn create_verify_email(&mut self, arg: CreateVerifyEmailParams) -> StoreResult<VerifyEmail>;
    async fn get_verify_email(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail>;
    /// Mark a pending, unexpired record matching id + code as used.
    ///
    /// Returns `NotFound` when nothing matches (wrong code, already used,
    /// expired or unknown id).
    async fn update_verify_email(&mut self, arg: UpdateVerifyEmailParams) -> StoreResult<VerifyEmail>;

    // outbox
    async fn create_outbox_message(&mut self, arg: CreateOutboxMessageParams) -> StoreResult<OutboxMessage>;
    /// Lock and return up to `limit` pending messages, oldest first. Rows
    /// locked by another unit are skipped.
    async fn claim_outbox_messages(&mut self, limit: i64) -> StoreResult<Vec<OutboxMessage>>;
    async fn mark_outbox_dispatched(&mut self, id: i64) -> StoreResult<()>;
}
