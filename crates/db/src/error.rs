use thiserror::Error;

use simplebank_core::DomainError;

/// Result type of every storage and workflow operation.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage / workflow error.
///
/// ## Error Categories
///
/// - **Validation**: malformed input, rejected before or by the store
/// - **NotFound**: a referenced account, user or verification record is absent
/// - **Conflict**: uniqueness or referential violation
/// - **Transient**: connectivity, scope-open, lock wait or timeout failures;
///   safe to retry at the caller's discretion
/// - **Hook**: a side effect inside a workflow failed and rolled the unit back
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("lock wait timed out on {0}")]
    LockTimeout(String),

    #[error("unit of work timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("side effect failed: {0}")]
    Hook(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Coarse classification used by callers to pick a response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Transient,
    Logic,
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Conflict(_) => ErrorKind::Conflict,
            StoreError::Transient(_) | StoreError::LockTimeout(_) | StoreError::Timeout(_) => {
                ErrorKind::Transient
            }
            StoreError::Hook(_) | StoreError::Serialization(_) => ErrorKind::Logic,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::Validation(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transient_family_is_retryable() {
        assert!(StoreError::transient("pool closed").is_retryable());
        assert!(StoreError::LockTimeout("account 1".into()).is_retryable());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!StoreError::conflict("duplicate").is_retryable());
        assert!(!StoreError::hook("enqueue failed").is_retryable());
    }

    #[test]
    fn domain_errors_become_validation() {
        let err: StoreError = DomainError::validation("amount must be positive").into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
