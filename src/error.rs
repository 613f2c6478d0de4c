//! Unified error handling for datakeep.
//!
//! Business-rule violations surface as typed variants that map onto the
//! [`ErrorType`] carried by the [`crate::response::Response`] envelope.
//! Only provider/connectivity faults are expected to escape to the caller
//! as hard errors.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error kind carried by the result envelope returned from facade operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    /// Operation succeeded.
    None,
    AccessDenied,
    NotFound,
    SchemaViolation,
    ConcurrencyConflict,
    InvalidUri,
    ProviderError,
    AlreadyExists,
}

/// Unified error type for all datakeep operations.
#[derive(Error, Debug)]
pub enum DataKeepError {
    /// The actor's effective permission resolved to Deny.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A record, dataset, database, user, role or log entry was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A document carried undeclared fields, or a schema definition is invalid.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// An optimistic version check failed, or replay found intervening changes.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// A permission access-uri could not be parsed.
    #[error("Invalid uri: {0}")]
    InvalidUri(String),

    /// A duplicate database, dataset, field, record or user id.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A backend failure that is not a business-rule violation.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DataKeepError {
    /// Maps this error onto the envelope error kind.
    pub fn error_type(&self) -> ErrorType {
        match self {
            DataKeepError::AccessDenied(_) => ErrorType::AccessDenied,
            DataKeepError::NotFound(_) => ErrorType::NotFound,
            DataKeepError::SchemaViolation(_) => ErrorType::SchemaViolation,
            DataKeepError::ConcurrencyConflict(_) => ErrorType::ConcurrencyConflict,
            DataKeepError::InvalidUri(_) => ErrorType::InvalidUri,
            DataKeepError::AlreadyExists(_) => ErrorType::AlreadyExists,
            DataKeepError::Provider(_)
            | DataKeepError::Config(_)
            | DataKeepError::Sled(_)
            | DataKeepError::Serde(_)
            | DataKeepError::Io(_) => ErrorType::ProviderError,
        }
    }
}

pub type DataKeepResult<T> = Result<T, DataKeepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_mapping() {
        assert_eq!(
            DataKeepError::AccessDenied("read".into()).error_type(),
            ErrorType::AccessDenied
        );
        assert_eq!(
            DataKeepError::NotFound("record x".into()).error_type(),
            ErrorType::NotFound
        );
        assert_eq!(
            DataKeepError::Provider("backend down".into()).error_type(),
            ErrorType::ProviderError
        );
        assert_eq!(
            DataKeepError::Config("bad toml".into()).error_type(),
            ErrorType::ProviderError
        );
    }

    #[test]
    fn test_wrapped_errors_map_to_provider() {
        let err: DataKeepError = serde_json::from_str::<serde_json::Value>("not json")
            .unwrap_err()
            .into();
        assert_eq!(err.error_type(), ErrorType::ProviderError);
    }
}
