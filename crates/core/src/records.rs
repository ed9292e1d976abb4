//! Ledger records as stored by the bank.
//!
//! These are plain data: they carry no persistence logic. The db crate reads
//! and writes them; the HTTP layer serializes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::currency::Currency;
use crate::error::{DomainError, DomainResult};
use crate::id::{AccountId, EntryId, TransferId, VerifyEmailId};

/// A customer account holding a balance in one currency.
///
/// `balance` is expressed in minor units and is only moved by the transfer
/// protocol's add-to-balance primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// One signed balance change against an account. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub account_id: AccountId,
    /// Negative for debits, positive for credits.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of money moved from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Always positive: the magnitude moved.
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    /// Check the intent of a transfer before any storage is touched.
    pub fn validate_request(from: AccountId, to: AccountId, amount: i64) -> DomainResult<()> {
        if amount <= 0 {
            return Err(DomainError::validation(format!(
                "transfer amount must be positive, got {amount}"
            )));
        }
        if from == to {
            return Err(DomainError::validation(format!(
                "cannot transfer from account {from} to itself"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_email_verified: bool,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub username: String,
    pub refresh_token: String,
    pub user_agent: String,
    pub client_ip: String,
    pub is_blocked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of an email verification record. `Used` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Used,
    Expired,
}

/// A one-shot secret sent to a user's mailbox to prove ownership of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmail {
    pub id: VerifyEmailId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub secret_code: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl VerifyEmail {
    pub fn status(&self, now: DateTime<Utc>) -> VerificationStatus {
        if self.is_used {
            VerificationStatus::Used
        } else if self.expired_at <= now {
            VerificationStatus::Expired
        } else {
            VerificationStatus::Pending
        }
    }

    /// Whether `secret_code` may consume this record at `now`.
    pub fn accepts(&self, secret_code: &str, now: DateTime<Utc>) -> bool {
        self.status(now) == VerificationStatus::Pending && self.secret_code == secret_code
    }
}
