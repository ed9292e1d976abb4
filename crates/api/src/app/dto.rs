use serde::{Deserialize, Serialize};

use simplebank_core::{DomainError, DomainResult};
use simplebank_db::page_window;

use crate::app::errors;

const PAGE_SIZE_MIN: i64 = 5;
const PAGE_SIZE_MAX: i64 = 10;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl CreateUserRequest {
    pub fn validate(&self) -> DomainResult<()> {
        validate_username(&self.username)?;
        validate_len("password", &self.password, 6, 100)?;
        validate_name("first_name", &self.first_name)?;
        validate_name("last_name", &self.last_name)?;
        validate_email(&self.email)
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub email_id: i64,
    pub secret_code: String,
}

impl VerifyEmailRequest {
    pub fn validate(&self) -> DomainResult<()> {
        if self.email_id < 1 {
            return Err(DomainError::validation("email_id must be a positive integer"));
        }
        validate_len("secret_code", &self.secret_code, 32, 128)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub owner: String,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub currency: String,
}

/// `?page_id=&page_size=` on list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page_id: Option<i64>,
    pub page_size: Option<i64>,
}

impl PageQuery {
    /// Validated `(page_id, page_size)`, defaulting to the first page of five.
    pub fn resolve(&self) -> DomainResult<(i64, i64)> {
        let page_id = self.page_id.unwrap_or(1);
        let page_size = self.page_size.unwrap_or(PAGE_SIZE_MIN);
        if page_id < 1 {
            return Err(DomainError::validation("page_id must be at least 1"));
        }
        if !(PAGE_SIZE_MIN..=PAGE_SIZE_MAX).contains(&page_size) {
            return Err(DomainError::validation(format!(
                "page_size must be between {PAGE_SIZE_MIN} and {PAGE_SIZE_MAX}"
            )));
        }
        Ok((page_id, page_size))
    }

    /// `(limit, offset)` for the requested page, or the 400 response to send.
    pub fn window(&self) -> Result<(i64, i64), axum::response::Response> {
        let (page_id, page_size) = self.resolve().map_err(errors::domain_error_to_response)?;
        page_window(page_id, page_size).map_err(errors::store_error_to_response)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListAccountsQuery {
    pub owner: String,
    pub page_id: Option<i64>,
    pub page_size: Option<i64>,
}

impl ListAccountsQuery {
    pub fn page(&self) -> PageQuery {
        PageQuery {
            page_id: self.page_id,
            page_size: self.page_size,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTransfersQuery {
    pub account_id: i64,
    pub page_id: Option<i64>,
    pub page_size: Option<i64>,
}

impl ListTransfersQuery {
    pub fn page(&self) -> PageQuery {
        PageQuery {
            page_id: self.page_id,
            page_size: self.page_size,
        }
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct VerifyEmailResponse {
    pub is_verified: bool,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

// -------------------------
// Field rules
// -------------------------

fn validate_len(field: &str, value: &str, min: usize, max: usize) -> DomainResult<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(DomainError::validation(format!(
            "{field} must contain from {min}-{max} characters"
        )));
    }
    Ok(())
}

fn validate_username(value: &str) -> DomainResult<()> {
    validate_len("username", value, 3, 100)?;
    if !value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(DomainError::validation(
            "username must contain only lowercase letters, digits, or underscore",
        ));
    }
    Ok(())
}

fn validate_name(field: &str, value: &str) -> DomainResult<()> {
    validate_len(field, value, 1, 100)?;
    if !value.chars().all(|c| c.is_alphabetic() || c == ' ') {
        return Err(DomainError::validation(format!("{field} must contain only letters or spaces")));
    }
    Ok(())
}

fn validate_email(value: &str) -> DomainResult<()> {
    validate_len("email", value, 3, 200)?;
    let valid = match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    };
    if !valid {
        return Err(DomainError::validation(format!("{value} is not a valid email address")));
    }
    Ok(())
}
