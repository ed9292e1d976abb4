//! Postgres backend (sqlx).
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | StoreError |
//! |------------|-----------------|------------|
//! | RowNotFound | N/A | `NotFound` |
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Database (data exception) | `22xxx` | `Validation` |
//! | Database (lock not available) | `55P03` | `LockTimeout` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Transient` |
//! | PoolClosed, PoolTimedOut, Io | N/A | `Transient` |
//! | Other | Any other | `Transient` |

use std::ops::DerefMut;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::instrument;
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

/// Pool-backed [`Database`].
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn open(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::transient(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgQueries::new(tx)))
    }

    async fn connect(&self) -> StoreResult<Box<dyn Querier>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        Ok(Box::new(PgQueries::new(conn)))
    }
}

/// The query set, bound to a pooled connection or an open transaction.
pub struct PgQueries<C> {
    conn: C,
}

impl<C> PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Transaction for PgQueries<sqlx::Transaction<'static, Postgres>> {
    fn querier(&mut self) -> &mut dyn Querier {
        self
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let PgQueries { conn } = *self;
        conn.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let PgQueries { conn } = *self;
        conn.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str = "username, hashed_password, first_name, last_name, email, \
                            is_email_verified, password_changed_at, created_at";
const SESSION_COLUMNS: &str = "id, username, refresh_token, user_agent, client_ip, is_blocked, \
                               expires_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str = "id, username, email, secret_code, is_used, created_at, expired_at";
const OUTBOX_COLUMNS: &str = "id, task_type, payload, queue, max_retry, process_in_secs, \
                              created_at, dispatched_at";

#[async_trait]
impl<C> Querier for PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    #[instrument(skip(self), fields(owner = %arg.owner, currency = %arg.currency), err)]
    async fn create_account(&mut self, arg: CreateAccountParams) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&arg.owner)
        .bind(arg.balance)
        .bind(arg.currency.code())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;
        account_from_row(&row)
    }

    async fn get_account(&mut self, id: AccountId) -> StoreResult<Account> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id.get())
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("get_account", e))?;
        account_from_row(&row)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("get_account_for_update", e))?;
        account_from_row(&row)
    }

    async fn list_accounts(&mut self, arg: ListAccountsParams) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(&arg.owner)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;
        rows.iter().map(account_from_row).collect()
    }

    async fn update_account(&mut self, arg: UpdateAccountParams) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.id.get())
        .bind(arg.balance)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("update_account", e))?;
        account_from_row(&row)
    }

    #[instrument(skip(self), fields(account_id = %arg.id, amount = arg.amount), err)]
    async fn add_account_balance(&mut self, arg: AddAccountBalanceParams) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(arg.id.get())
        .bind(arg.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("add_account_balance", e))?;
        account_from_row(&row)
    }

    async fn delete_account(&mut self, id: AccountId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;
        expect_one(result.rows_affected(), || format!("account {id}"))
    }

    async fn create_entry(&mut self, arg: CreateEntryParams) -> StoreResult<Entry> {
        let row = sqlx::query(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(arg.account_id.get())
        .bind(arg.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_entry", e))?;
        entry_from_row(&row)
    }

    async fn get_entry(&mut self, id: EntryId) -> StoreResult<Entry> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"))
            .bind(id.get())
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("get_entry", e))?;
        entry_from_row(&row)
    }

    async fn list_entries(&mut self, arg: ListEntriesParams) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(arg.account_id.get())
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn delete_entry(&mut self, id: EntryId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM entries WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("delete_entry", e))?;
        expect_one(result.rows_affected(), || format!("entry {id}"))
    }

    async fn create_transfer(&mut self, arg: CreateTransferParams) -> StoreResult<Transfer> {
        let row = sqlx::query(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
             RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(arg.from_account_id.get())
        .bind(arg.to_account_id.get())
        .bind(arg.amount)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_transfer", e))?;
        transfer_from_row(&row)
    }

    async fn get_transfer(&mut self, id: TransferId) -> StoreResult<Transfer> {
        let row = sqlx::query(&format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"))
            .bind(id.get())
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("get_transfer", e))?;
        transfer_from_row(&row)
    }

    async fn list_transfers(&mut self, arg: ListTransfersParams) -> StoreResult<Vec<Transfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(arg.account_id.get())
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("list_transfers", e))?;
        rows.iter().map(transfer_from_row).collect()
    }

    async fn delete_transfer(&mut self, id: TransferId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM transfers WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("delete_transfer", e))?;
        expect_one(result.rows_affected(), || format!("transfer {id}"))
    }

    #[instrument(skip(self, arg), fields(username = %arg.username), err)]
    async fn create_user(&mut self, arg: CreateUserParams) -> StoreResult<User> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (username, hashed_password, first_name, last_name, email) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
        ))
        .bind(&arg.username)
        .bind(&arg.hashed_password)
        .bind(&arg.first_name)
        .bind(&arg.last_name)
        .bind(&arg.email)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;
        user_from_row(&row)
    }

    async fn get_user(&mut self, username: &str) -> StoreResult<User> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"))
            .bind(username)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?;
        user_from_row(&row)
    }

    async fn update_user(&mut self, arg: UpdateUserParams) -> StoreResult<User> {
        let row = sqlx::query(&format!(
            "UPDATE users SET \
                hashed_password = COALESCE($2, hashed_password), \
                password_changed_at = CASE WHEN $2::TEXT IS NULL THEN password_changed_at ELSE now() END, \
                first_name = COALESCE($3, first_name), \
                last_name = COALESCE($4, last_name), \
                email = COALESCE($5, email), \
                is_email_verified = COALESCE($6, is_email_verified) \
             WHERE username = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(&arg.username)
        .bind(arg.hashed_password.as_deref())
        .bind(arg.first_name.as_deref())
        .bind(arg.last_name.as_deref())
        .bind(arg.email.as_deref())
        .bind(arg.is_email_verified)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("update_user", e))?;
        user_from_row(&row)
    }

    async fn delete_user(&mut self, username: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM users WHERE username = $1")
            .bind(username)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("delete_user", e))?;
        expect_one(result.rows_affected(), || format!("user {username}"))
    }

    async fn create_session(&mut self, arg: CreateSessionParams) -> StoreResult<Session> {
        let row = sqlx::query(&format!(
            "INSERT INTO sessions (id, username, refresh_token, user_agent, client_ip, is_blocked, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {SESSION_COLUMNS}"
        ))
        .bind(arg.id)
        .bind(&arg.username)
        .bind(&arg.refresh_token)
        .bind(&arg.user_agent)
        .bind(&arg.client_ip)
        .bind(arg.is_blocked)
        .bind(arg.expires_at)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_session", e))?;
        session_from_row(&row)
    }

    async fn get_session(&mut self, id: Uuid) -> StoreResult<Session> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"))
            .bind(id)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("get_session", e))?;
        session_from_row(&row)
    }

    async fn create_verify_email(&mut self, arg: CreateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        let row = sqlx::query(&format!(
            "INSERT INTO verify_emails (username, email, secret_code, expired_at) \
             VALUES ($1, $2, $3, $4) RETURNING {VERIFY_EMAIL_COLUMNS}"
        ))
        .bind(&arg.username)
        .bind(&arg.email)
        .bind(&arg.secret_code)
        .bind(arg.expired_at)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_verify_email", e))?;
        verify_email_from_row(&row)
    }

    async fn get_verify_email(&mut self, id: VerifyEmailId) -> StoreResult<VerifyEmail> {
        let row = sqlx::query(&format!(
            "SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_emails WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("get_verify_email", e))?;
        verify_email_from_row(&row)
    }

    #[instrument(skip(self, arg), fields(id = %arg.id), err)]
    async fn update_verify_email(&mut self, arg: UpdateVerifyEmailParams) -> StoreResult<VerifyEmail> {
        let row = sqlx::query(&format!(
            "UPDATE verify_emails SET is_used = TRUE \
             WHERE id = $1 AND secret_code = $2 AND is_used = FALSE AND expired_at > now() \
             RETURNING {VERIFY_EMAIL_COLUMNS}"
        ))
        .bind(arg.id.get())
        .bind(&arg.secret_code)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("update_verify_email", e))?;
        verify_email_from_row(&row)
    }

    async fn create_outbox_message(&mut self, arg: CreateOutboxMessageParams) -> StoreResult<OutboxMessage> {
        let row = sqlx::query(&format!(
            "INSERT INTO outbox (task_type, payload, queue, max_retry, process_in_secs) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(&arg.task_type)
        .bind(&arg.payload)
        .bind(&arg.queue)
        .bind(arg.max_retry)
        .bind(arg.process_in_secs)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("create_outbox_message", e))?;
        outbox_from_row(&row)
    }

    async fn claim_outbox_messages(&mut self, limit: i64) -> StoreResult<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE dispatched_at IS NULL \
             ORDER BY id LIMIT $1 FOR UPDATE SKIP LOCKED"
        ))
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await
        .map_err(|e| map_sqlx_error("claim_outbox_messages", e))?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_outbox_dispatched(&mut self, id: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE outbox SET dispatched_at = now() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("mark_outbox_dispatched", e))?;
        expect_one(result.rows_affected(), || format!("outbox message {id}"))
    }
}

fn expect_one(rows_affected: u64, what: impl FnOnce() -> String) -> StoreResult<()> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound(what()));
    }
    Ok(())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Serialization(format!("failed to read column {name}: {e}")))
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    let currency: String = column(row, "currency")?;
    Ok(Account {
        id: AccountId::new(column(row, "id")?),
        owner: column(row, "owner")?,
        balance: column(row, "balance")?,
        currency: Currency::from_str(&currency)?,
        created_at: column(row, "created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> StoreResult<Entry> {
    Ok(Entry {
        id: EntryId::new(column(row, "id")?),
        account_id: AccountId::new(column(row, "account_id")?),
        amount: column(row, "amount")?,
        created_at: column(row, "created_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> StoreResult<Transfer> {
    Ok(Transfer {
        id: TransferId::new(column(row, "id")?),
        from_account_id: AccountId::new(column(row, "from_account_id")?),
        to_account_id: AccountId::new(column(row, "to_account_id")?),
        amount: column(row, "amount")?,
        created_at: column(row, "created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        username: column(row, "username")?,
        hashed_password: column(row, "hashed_password")?,
        first_name: column(row, "first_name")?,
        last_name: column(row, "last_name")?,
        email: column(row, "email")?,
        is_email_verified: column(row, "is_email_verified")?,
        password_changed_at: column(row, "password_changed_at")?,
        created_at: column(row, "created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> StoreResult<Session> {
    Ok(Session {
        id: column(row, "id")?,
        username: column(row, "username")?,
        refresh_token: column(row, "refresh_token")?,
        user_agent: column(row, "user_agent")?,
        client_ip: column(row, "client_ip")?,
        is_blocked: column(row, "is_blocked")?,
        expires_at: column(row, "expires_at")?,
        created_at: column(row, "created_at")?,
    })
}

fn verify_email_from_row(row: &PgRow) -> StoreResult<VerifyEmail> {
    Ok(VerifyEmail {
        id: VerifyEmailId::new(column(row, "id")?),
        username: column(row, "username")?,
        email: column(row, "email")?,
        secret_code: column(row, "secret_code")?,
        is_used: column(row, "is_used")?,
        created_at: column(row, "created_at")?,
        expired_at: column(row, "expired_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> StoreResult<OutboxMessage> {
    Ok(OutboxMessage {
        id: column(row, "id")?,
        task_type: column(row, "task_type")?,
        payload: column(row, "payload")?,
        queue: column(row, "queue")?,
        max_retry: column(row, "max_retry")?,
        process_in_secs: column(row, "process_in_secs")?,
        created_at: column(row, "created_at")?,
        dispatched_at: column(row, "dispatched_at")?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row in {operation}")),
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23503") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Validation(msg),
                Some(code) if code.starts_with("22") => StoreError::Validation(msg),
                Some("55P03") => StoreError::LockTimeout(msg),
                _ => StoreError::Transient(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("connection pool timed out in {operation}"))
        }
        _ => StoreError::Transient(format!("sqlx error in {operation}: {err}")),
    }
}
