//! In-memory backend.
//!
//! Intended for tests/dev. It behaves like a small row-locking database:
//!
//! - writes made inside a unit are staged and only become visible to other
//!   units on commit;
//! - mutating a row takes that row's lock, held until the unit ends, so two
//!   units updating the same account are serialized;
//! - waiting longer than `lock_timeout` on a row lock fails the unit with
//!   [`StoreError::LockTimeout`] instead of hanging;
//! - id sequences are never rolled back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use uuid::Uuid;

use simplebank_core::{
    Account, AccountId, Currency, Entry, EntryId, Session, Transfer, TransferId, User, VerifyEmail,
    VerifyEmailId,
};

use crate::error::{StoreError, StoreResult};
use crate::outbox::OutboxMessage;
use crate::params::*;
use crate::querier::Querier;
use crate::unit_of_work::{Database, Transaction};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Operations that can be forced to fail once, to exercise rollback paths.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryOp {
    CreateTransfer,
    CreateEntry,
    AddAccountBalance,
    CreateUser,
    CreateOutboxMessage,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    OwnerCurrency(String, Currency),
    User(String),
    Email(String),
    VerifyEmail(VerifyEmailId),
    Outbox(i64),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Account(id) => write!(f, "account {id}"),
            RowKey::OwnerCurrency(owner, currency) => write!(f, "account key ({owner}, {currency})"),
            RowKey::User(username) => write!(f, "user {username}"),
            RowKey::Email(email) => write!(f, "email {email}"),
            RowKey::VerifyEmail(id) => write!(f, "verify email {id}"),
            RowKey::Outbox(id) => write!(f, "outbox message {id}"),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    users: BTreeMap<String, User>,
    sessions: BTreeMap<Uuid, Session>,
    verify_emails: BTreeMap<VerifyEmailId, VerifyEmail>,
    outbox: BTreeMap<i64, OutboxMessage>,
}

/// Uncommitted writes of one unit. `None` marks a deleted row.
#[derive(Debug, Default)]
struct Staged {
    accounts: BTreeMap<AccountId, Option<Account>>,
    entries: BTreeMap<EntryId, Option<Entry>>,
    transfers: BTreeMap<TransferId, Option<Transfer>>,
    users: BTreeMap<String, Option<User>>,
    sessions: BTreeMap<Uuid, Option<Session>>,
    verify_emails: BTreeMap<VerifyEmailId, Option<VerifyEmail>>,
    outbox: BTreeMap<i64, Option<OutboxMessage>>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.entries.is_empty()
            && self.transfers.is_empty()
            && self.users.is_empty()
            && self.sessions.is_empty()
            && self.verify_emails.is_empty()
            && self.outbox.is_empty()
    }

    fn apply_to(self, tables: &mut Tables) {
        apply(&mut tables.accounts, self.accounts);
        apply(&mut tables.entries, self.entries);
        apply(&mut tables.transfers, self.transfers);
        apply(&mut tables.users, self.users);
        apply(&mut tables.sessions, self.sessions);
        apply(&mut tables.verify_emails, self.verify_emails);
        apply(&mut tables.outbox, self.outbox);
    }
}

fn apply<K: Ord, V>(table: &mut BTreeMap<K, V>, writes: BTreeMap<K, Option<V>>) {
    for (key, value) in writes {
        match value {
            Some(value) => {
                table.insert(key, value);
            }
            None => {
                table.remove(&key);
            }
        }
    }
}

/// Row as seen from inside a unit: its own staged write wins.
fn visible<K: Ord, V: Clone>(table: &BTreeMap<K, V>, staged: &BTreeMap<K, Option<V>>, key: &K) -> Option<V> {
    match staged.get(key) {
        Some(write) => write.clone(),
        None => table.get(key).cloned(),
    }
}

/// All rows visible from inside a unit, in key order.
fn visible_rows<K: Ord + Clone, V: Clone>(table: &BTreeMap<K, V>, staged: &BTreeMap<K, Option<V>>) -> Vec<V> {
    let mut merged: BTreeMap<K, V> = table.clone();
    for (key, write) in staged {
        match write {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged.into_values().collect()
}

fn window<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize).take(limit.max(0) as usize).collect()
}

#[derive(Debug, Default)]
struct Sequences {
    accounts: AtomicI64,
    entries: AtomicI64,
    transfers: AtomicI64,
    verify_emails: AtomicI64,
    outbox: AtomicI64,
}

fn next(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
    seq: Sequences,
    lock_timeout: Duration,
    available: AtomicBool,
    armed_failures: Mutex<HashSet<QueryOp>>,
}

impl Shared {
    fn row_lock(&self, key: &RowKey) -> StoreResult<Arc<RowMutex<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::transient("row lock table poisoned"))?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    /// Forget lock entries nobody holds or waits on.
    fn prune_row_locks(&self, keys: &[RowKey]) {
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        for key in keys {
            if locks.get(key).is_some_and(|row| Arc::strong_count(row) == 1) {
                locks.remove(key);
            }
        }
    }

    fn take_failure(&self, op: QueryOp) -> StoreResult<()> {
        let mut armed = self
            .armed_failures
            .lock()
            .map_err(|_| StoreError::transient("failure table poisoned"))?;
        if armed.remove(&op) {
            return Err(StoreError::transient(format!("injected failure in {op:?}")));
        }
        Ok(())
    }
}

/// Shared in-memory database. Clones share the same tables.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                seq: Sequences::default(),
                lock_timeout,
                available: AtomicBool::new(true),
                armed_failures: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Simulate the store going away: `begin` and `connect` fail while false.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `op` fail with a transient error.
    pub fn inject_failure(&self, op: QueryOp) {
        if let Ok(mut armed) = self.shared.armed_failures.lock() {
            armed.insert(op);
        }
    }

    fn open(&self, autocommit: bool) -> StoreResult<MemoryConn> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(StoreError::transient("database unavailable"));
        }
        Ok(MemoryConn {
            shared: self.shared.clone(),
            staged: Staged::default(),
            held: HashMap::new(),
            autocommit,
        })
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        Ok(Box::new(self.open(false)?))
    }

    async fn connect(&self) -> StoreResult<Box<dyn Querier>> {
        Ok(Box::new(self.open(true)?))
    }
}

/// One connection. In autocommit mode every call settles on its own;
/// otherwise it is a unit of work ended by `commit`/`rollback` (or drop).
struct MemoryConn {
    shared: Arc<Shared>,
    staged: Staged,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    autocommit: bool,
}

impl MemoryConn {
    fn tables(&self) -> StoreResult<std::sync::MutexGuard<'_, Tables>> {
        self.shared
            .tables
            .lock()
            .map_err(|_| StoreError::transient("table lock poisoned"))
    }

    /// Take `key`'s row lock for the rest of the unit. Re-entrant.
    async fn lock(&mut self, key: RowKey) -> StoreResult<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let row = self.shared.row_lock(&key)?;
        let acquired = tokio::time::timeout(self.shared.lock_timeout, row.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                self.held.insert(key, guard);
                Ok(())
            }
            Err(_) => {
                self.shared.prune_row_locks(std::slice::from_ref(&key));
                Err(StoreError::LockTimeout(key.to_string()))
            }
        }
    }

    /// Take `key`'s row lock only if nobody holds it.
    fn try_lock(&mut self, key: RowKey) -> StoreResult<bool> {
        if self.held.contains_key(&key) {
            return Ok(true);
        }
        let row = self.shared.row_lock(&key)?;
        match row.try_lock_owned() {
            Ok(guard) => {
                self.held.insert(key, guard);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self.held.keys().cloned().collect();
        self.held.clear();
        self.shared.prune_row_locks(&keys);
    }

    fn publish(&mut self) -> StoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        if !staged.is_empty() {
            let mut tables = self.tables()?;
            staged.apply_to(&mut tables);
        }
        self.release_locks();
        Ok(())
    }

    fn discard(&mut self) {
        self.staged = Staged::default();
        self.release_locks();
    }

    /// End an autocommit call; a no-op inside a unit of work.
    fn settle<T>(&mut self, result: StoreResult<T>) -> StoreResult<T> {
        if !self.autocommit {
            return result;
        }
        match result {
            Ok(value) => {
                self.publish()?;
                Ok(value)
            }
            Err(err) => {
                self.discard();
                Err(err)
            }
        }
    }

    fn account(&self, id: AccountId) -> StoreResult<Account> {
        visible(&self.tables()?.accounts, &self.staged.accounts, &id)
            .ok_or_else(|| StoreError::not_found(format!("account {id}")))
    }

    fn user(&self, username: &str) -> StoreResult<User> {
        visible(&self.tables()?.users, &self.staged.users, &username.to_string())
            .ok_or_else(|| StoreError::not_found(format!("user {username}")))
    }

    fn require_account(&self, id: AccountId) -> StoreResult<()> {
        match self.account(id) {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Err(StoreError::conflict(format!(
                "account {id} does not exist"
            ))),
            Err(err) => Err(err),
        }
    }

    fn require_user(&self, username: &str) -> StoreResult<()> {
        match self.user(username) {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Err(StoreError::conflict(format!(
                "user {username} does not exist"
            ))),
            Err(err) => Err(err),
        }
    }

    async fn do_create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account> {
        self.require_user(&arg.owner)?;
        self.lock(RowKey::OwnerCurrency(arg.owner.clone(), arg.currency)).await?;

        let duplicate = {
            let tables = self.tables()?;
            visible_rows(&tables.accounts, &self.staged.accounts)
                .iter()
                .any(|a| a.owner == arg.owner && a.currency == arg.currency)
        };
        if duplicate {
            return Err(StoreError::conflict(format!(
                "{} already owns a {} account",
                arg.owner, arg.currency
            )));
        }

        let account = Account {
            id: AccountId::new(next(&self.shared.seq.accounts)),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: Utc::now(),
        };
        self.lock(RowKey::Account(account.id)).await?;
        self.staged.accounts.insert(account.id, Some(account.clone()));
        Ok(account)
    }

    async fn do_get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account> {
        self.lock(RowKey::Account(id)).await?;
        self.account(id)
    }

    fn do_list_accounts(&self, arg: ListAccountsParams) -> StoreResult<Vec<Account>> {
        let tables = self.tables()?;
        let rows = visible_rows(&tables.accounts, &self.staged.accounts);
        Ok(window(
            rows.into_iter().filter(|a| a.owner == arg.owner),
            arg.limit,
            arg.offset,
        ))
    }

    async fn do_update_account(&mut self, arg: UpdateAccountParams) -> StoreResult<Account> {
        self.lock(RowKey::Account(arg.id)).await?;
        let mut account = self.account(arg.id)?;
        account.balance = arg.balance;
        self.staged.accounts.insert(account.id, Some(account.clone()));
        Ok(account)
    }

    async fn do_add_account_balance(&mut self, arg: AddAccountBalanceParams) -> StoreResult<Account> {
        self.lock(RowKey::Account(arg.id)).await?;
        self.shared.take_failure(QueryOp::AddAccountBalance)?;
        let mut account = self.account(arg.id)?;
        account.balance = account.balance.checked_add(arg.amount).ok_or_else(|| {
            StoreError::Validation(format!("balance of account {} out of range", arg.id))
        })?;
        self.staged.accounts.insert(account.id, Some(account.clone()));
        Ok(account)
    }

    async fn do_delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        self.lock(RowKey::Account(id)).await?;
        self.account(id)?;
        let referenced = {
            let tables = self.tables()?;
            visible_rows(&tables.entries, &self.staged.entries)
                .iter()
                .any(|e| e.account_id == id)
                || visible_rows(&tables.transfers, &self.staged.transfers)
                    .iter()
                    .any(|t| t.from_account_id == id || t.to_account_id == id)
        };
        if referenced {
            return Err(StoreError::conflict(format!("account {id} is still referenced")));
        }
        self.staged.accounts.insert(id, None);
        Ok(())
    }

    fn do_create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry> {
        self.shared.take_failure(QueryOp::CreateEntry)?;
        self.require_account(arg.account_id)?;
        let entry = Entry {
            id: EntryId::new(next(&self.shared.seq.entries)),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.staged.entries.insert(entry.id, Some(entry.clone()));
        Ok(entry)
    }

    fn do_create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer> {
        self.shared.take_failure(QueryOp::CreateTransfer)?;
        if arg.amount <= 0 {
            return Err(StoreError::Validation(format!(
                "transfer amount must be positive, got {}",
                arg.amount
            )));
        }
        self.require_account(arg.from_account_id)?;
        self.require_account(arg.to_account_id)?;
        let transfer = Transfer {
            id: TransferId::new(next(&self.shared.seq.transfers)),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.staged.transfers.insert(transfer.id, Some(transfer.clone()));
        Ok(transfer)
    }

    async fn do_create_user(&mut self, arg: CreateUserParams) -> StoreResult<User> {
        self.shared.take_failure(QueryOp::CreateUser)?;
        self.lock(RowKey::User(arg.username.clone())).await?;
        self.lock(RowKey::Email(arg.email.clone())).await?;

        let (name_taken, email_taken) = {
            let tables = self.tables()?;
            let users = visible_rows(&tables.users, &self.staged.users);
            (
                users.iter().any(|u| u.username == arg.username),
                users.iter().any(|u| u.email == arg.email),
            )
        };
        if name_taken {
            return Err(StoreError::conflict(format!("username {} is taken", arg.username)));
        }
        if email_taken {
            return Err(StoreError::conflict(format!("email {} is taken", arg.email)));
        }

        let now = Utc::now();
        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            first_name: arg.first_name,
            last_name: arg.last_name,
            email: arg.email,
            is_email_verified: false,
            password_changed_at: now,
            created_at: now,
        };
        self.staged.users.insert(user.username.clone(), Some(user.clone()));
        Ok(user)
    }

    async fn do_update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User> {
        self.lock(RowKey::User(arg.username.clone())).await?;
        let mut user = self.user(&arg.username)?;

        if let Some(email) = arg.email {
            if email != user.email {
                self.lock(RowKey::Email(email.clone())).await?;
                let taken = {
                    let tables = self.tables()?;
                    visible_rows(&tables.users, &self.staged.users)
                        .iter()
                        .any(|u| u.email == email)
                };
                if taken {
                    return Err(StoreError::conflict(format!("email {email} is taken")));
                }
                user.email = email;
            }
        }
        if let Some(hashed_password) = arg.hashed_password {
            user.hashed_password = hashed_password;
            user.password_changed_at = Utc::now();
        }
        if let Some(first_name) = arg.first_name {
            user.first_name = first_name;
        }
        if let Some(last_name) = arg.last_name {
            user.last_name = last_name;
        }
        if let Some(verified) = arg.is_email_verified {
            user.is_email_verified = verified;
        }

        self.staged.users.insert(user.username.clone(), Some(user.clone()));
        Ok(user)
    }

    async fn do_delete_user(&mut self, username: &str) -> StoreResult<()> {
        self.lock(RowKey::User(username.to_string())).await?;
        self.user(username)?;
        let referenced = {
            let tables = self.tables()?;
            visible_rows(&tables.accounts, &self.staged.accounts)
                .iter()
                .any(|a| a.owner == username)
        };
        if referenced {
            return Err(StoreError::conflict(format!("user {username} still owns accounts")));
        }
        self.staged.users.insert(username.to_string(), None);
        Ok(())
    }

    fn do_create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session> {
        self.require_user(&arg.username)?;
        let exists = visible(&self.tables()?.sessions, &self.staged.sessions, &arg.id).is_some();
        if exists {
            return Err(StoreError::conflict(format!("session {} already exists", arg.id)));
        }
        let session = Session {
            id: arg.id,
            username: arg.username,
            refresh_token: arg.refresh_token,
            user_agent: arg.user_agent,
            client_ip: arg.client_ip,
            is_blocked: arg.is_blocked,
            expires_at: arg.expires_at,
            created_at: Utc::now(),
        };
        self.staged.sessions.insert(session.id, Some(session.clone()));
        Ok(session)
    }

    fn do_create_verify_email(&mut self, arg: CreateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        self.require_user(&arg.username)?;
        let record = VerifyEmail {
            id: VerifyEmailId::new(next(&self.shared.seq.verify_emails)),
            username: arg.username,
            email: arg.email,
            secret_code: arg.secret_code,
            is_used: false,
            created_at: Utc::now(),
            expired_at: arg.expired_at,
        };
        self.staged.verify_emails.insert(record.id, Some(record.clone()));
        Ok(record)
    }

    async fn do_update_verify_email(&mut self, arg: UpdateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        self.lock(RowKey::VerifyEmail(arg.id)).await?;
        let current = visible(&self.tables()?.verify_emails, &self.staged.verify_emails, &arg.id);
        let mut record = match current {
            Some(record) if record.accepts(&arg.secret_code, Utc::now()) => record,
            _ => {
                return Err(StoreError::not_found(format!(
                    "pending verify email {} with matching code",
                    arg.id
                )));
            }
        };
        record.is_used = true;
        self.staged.verify_emails.insert(record.id, Some(record.clone()));
        Ok(record)
    }

    fn do_create_outbox_message(&mut self, arg: CreateOutboxMessageParams) -> StoreResult<OutboxMessage> {
        self.shared.take_failure(QueryOp::CreateOutboxMessage)?;
        let message = OutboxMessage {
            id: next(&self.shared.seq.outbox),
            task_type: arg.task_type,
            payload: arg.payload,
            queue: arg.queue,
            max_retry: arg.max_retry,
            process_in_secs: arg.process_in_secs,
            created_at: Utc::now(),
            dispatched_at: None,
        };
        self.staged.outbox.insert(message.id, Some(message.clone()));
        Ok(message)
    }

    fn do_claim_outbox_messages(&mut self, limit: i64) -> StoreResult<Vec<OutboxMessage>> {
        let pending: Vec<OutboxMessage> = {
            let tables = self.tables()?;
            visible_rows(&tables.outbox, &self.staged.outbox)
                .into_iter()
                .filter(OutboxMessage::is_pending)
                .collect()
        };

        let mut claimed = Vec::new();
        for message in pending {
            if claimed.len() as i64 >= limit {
                break;
            }
            if self.try_lock(RowKey::Outbox(message.id))? {
                // Re-read: another unit may have dispatched it before releasing the lock.
                let current = visible(&self.tables()?.outbox, &self.staged.outbox, &message.id);
                if let Some(current) = current.filter(OutboxMessage::is_pending) {
                    claimed.push(current);
                }
            }
        }
        Ok(claimed)
    }

    async fn do_mark_outbox_dispatched(&mut self, id: i64) -> StoreResult<()> {
        self.lock(RowKey::Outbox(id)).await?;
        let mut message = visible(&self.tables()?.outbox, &self.staged.outbox, &id)
            .ok_or_else(|| StoreError::not_found(format!("outbox message {id}")))?;
        message.dispatched_at = Some(Utc::now());
        self.staged.outbox.insert(id, Some(message));
        Ok(())
    }
}

impl Drop for MemoryConn {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[async_trait]
impl Querier for MemoryConn {
    async fn create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account> {
        let result = self.do_create_account(arg).await;
        self.settle(result)
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        self.account(id)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account> {
        let result = self.do_get_account_for_update(id).await;
        self.settle(result)
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> StoreResult<Vec<Account>> {
        self.do_list_accounts(arg)
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> StoreResult<Account> {
        let result = self.do_update_account(arg).await;
        self.settle(result)
    }

    async fn add_account_balance(&mut self, arg: AddAccountBalanceParams) -> StoreResult<Account> {
        let result = self.do_add_account_balance(arg).await;
        self.settle(result)
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        let result = self.do_delete_account(id).await;
        self.settle(result)
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry> {
        let result = self.do_create_entry(arg);
        self.settle(result)
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        visible(&self.tables()?.entries, &self.staged.entries, &id)
            .ok_or_else(|| StoreError::not_found(format!("entry {id}")))
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        let tables = self.tables()?;
        let rows = visible_rows(&tables.entries, &self.staged.entries);
        Ok(window(
            rows.into_iter().filter(|e| e.account_id == arg.account_id),
            arg.limit,
            arg.offset,
        ))
    }

    async fn delete_entry(&mut self, id: EntryId) -> StoreResult<()> {
        let result = self.get_entry(id).await.map(|_| {
            self.staged.entries.insert(id, None);
        });
        self.settle(result)
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer> {
        let result = self.do_create_transfer(arg);
        self.settle(result)
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        visible(&self.tables()?.transfers, &self.staged.transfers, &id)
            .ok_or_else(|| StoreError::not_found(format!("transfer {id}")))
    }

    async fn list_transfers(&mut self, arg: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        let tables = self.tables()?;
        let rows = visible_rows(&tables.transfers, &self.staged.transfers);
        Ok(window(
            rows.into_iter()
                .filter(|t| t.from_account_id == arg.account_id || t.to_account_id == arg.account_id),
            arg.limit,
            arg.offset,
        ))
    }

    async fn delete_transfer(&mut self, id: TransferId) -> StoreResult<()> {
        let result = self.get_transfer(id).await.map(|_| {
            self.staged.transfers.insert(id, None);
        });
        self.settle(result)
    }

    async fn create_user(&mut self, arg: CreateUserParams) -> StoreResult<User> {
        let result = self.do_create_user(arg).await;
        self.settle(result)
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        self.user(username)
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User> {
        let result = self.do_update_user(arg).await;
        self.settle(result)
    }

    async fn delete_user(&mut self, username: &str) -> StoreResult<()> {
        let result = self.do_delete_user(username).await;
        self.settle(result)
    }

    async fn create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session> {
        let result = self.do_create_session(arg);
        self.settle(result)
    }

    async fn get_session(&mut self, id: Uuid) -> StoreResult<Session> {
        visible(&self.tables()?.sessions, &self.staged.sessions, &id)
            .ok_or_else(|| StoreError::not_found(format!("session {id}")))
    }

    async fn create_verify_email(&mut self, arg: CreateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        let result = self.do_create_verify_email(arg);
        self.settle(result)
    }

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail> {
        visible(&self.tables()?.verify_emails, &self.staged.verify_emails, &id)
            .ok_or_else(|| StoreError::not_found(format!("verify email {id}")))
    }

    async fn update_verify_email(&mut self, arg: UpdateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        let result = self.do_update_verify_email(arg).await;
        self.settle(result)
    }

    async fn create_outbox_message(&mut self, arg: CreateOutboxMessageParams) -> StoreResult<OutboxMessage> {
        let result = self.do_create_outbox_message(arg);
        self.settle(result)
    }

    async fn claim_outbox_messages(&mut self, limit: i64) -> StoreResult<Vec<OutboxMessage>> {
        let result = self.do_claim_outbox_messages(limit);
        self.settle(result)
    }

    async fn mark_outbox_dispatched(&mut self, id: i64) -> StoreResult<()> {
        let result = self.do_mark_outbox_dispatched(id).await;
        self.settle(result)
    }
}

#[async_trait]
impl Transaction for MemoryConn {
    fn querier(&mut self) -> &mut dyn Querier {
        self
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        if let Err(err) = self.shared.take_failure(QueryOp::Commit) {
            self.discard();
            return Err(err);
        }
        self.publish()
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.discard();
        self.shared.take_failure(QueryOp::Rollback)
    }
}
