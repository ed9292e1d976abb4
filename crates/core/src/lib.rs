//! `simplebank-core`: domain building blocks of the ledger.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, currencies, ledger records and their validation rules.

pub mod currency;
pub mod error;
pub mod id;
pub mod records;

pub use currency::Currency;
pub use error::{DomainError, DomainResult};
pub use id::{AccountId, EntryId, TransferId, VerifyEmailId};
pub use records::{Account, Entry, Session, Transfer, User, VerificationStatus, VerifyEmail};
