//! Parameter structs of the primitive query layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use simplebank_core::{AccountId, Currency, VerifyEmailId};

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAccountsParams {
    pub owner: String,
    pub limit: i64,
    pub offset: i64,
}

/// Administrative overwrite of a balance. Never used by the transfer path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateAccountParams {
    pub id: AccountId,
    pub balance: i64,
}

/// Atomic `balance = balance + amount` on one row.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddAccountBalanceParams {
    pub id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ListEntriesParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Transfers touching an account in either direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ListTransfersParams {
    pub account_id: AccountId,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

/// Partial update: `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateUserParams {
    pub username: String,
    pub hashed_password: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub is_email_verified: Option<bool>,
}

impl UpdateUserParams {
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionParams {
    pub id: Uuid,
    pub username: String,
    pub refresh_token: String,
    pub user_agent: String,
    pub client_ip: String,
    pub is_blocked: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVerifyEmailParams {
    pub username: String,
    pub email: String,
    pub secret_code: String,
    pub expired_at: DateTime<Utc>,
}

/// Consume a pending, unexpired verification record matching id + code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateVerifyEmailParams {
    pub id: VerifyEmailId,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOutboxMessageParams {
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub max_retry: i32,
    pub process_in_secs: i64,
}

/// Turn a 1-based page number and page size into `(limit, offset)`.
///
/// Pages whose offset does not fit an `i64` are a validation error.
pub fn page_window(page_id: i64, page_size: i64) -> StoreResult<(i64, i64)> {
    let page_id = page_id.max(1);
    let page_size = page_size.max(1);
    let offset = (page_id - 1)
        .checked_mul(page_size)
        .ok_or_else(|| StoreError::Validation(format!("page {page_id} of size {page_size} is out of range")))?;
    Ok((page_size, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_window_is_one_based() {
        assert_eq!(page_window(1, 5).unwrap(), (5, 0));
        assert_eq!(page_window(3, 10).unwrap(), (10, 20));
        assert_eq!(page_window(0, 0).unwrap(), (1, 0));
    }

    #[test]
    fn page_window_rejects_offsets_past_i64() {
        let err = page_window(i64::MAX, 10).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(page_window(i64::MAX, 1).unwrap(), (1, i64::MAX - 1));
    }
}
