use std::collections::BTreeMap;

use thiserror::Error;

/// Validation errors keyed by field path (dot notation for nested fields,
/// `[index]` suffixes for list items, a numeric prefix for batch entries).
/// Shape-level errors that are not tied to a field use an empty key.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Build a single shape-level error mapping (empty field key).
pub fn shape_error(message: &str) -> FieldErrors {
    let mut errors = FieldErrors::new();
    errors.insert(String::new(), vec![message.to_string()]);
    errors
}

#[derive(Error, Debug)]
pub enum DocBaseError {
    /// The input's shape or a field's value violates a static rule.
    /// Carries the original received input and per-field error messages.
    #[error("Validation failed: {errors:?}")]
    Validation {
        received: serde_json::Value,
        errors: FieldErrors,
    },

    /// An update or rollback target does not exist.
    #[error("No document matching {key} could be found")]
    NotFound { key: serde_json::Value },

    /// Invalid model or field definition. Raised at definition time and
    /// intentionally fatal: the caller's model declaration is defective.
    #[error("Definition error: {0}")]
    Definition(String),

    /// The backend could not be reached or its connection is unusable.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DocBaseError {
    /// Validation failure carrying the received input and field errors.
    pub fn validation(received: serde_json::Value, errors: FieldErrors) -> Self {
        DocBaseError::Validation { received, errors }
    }

    /// Validation failure carrying a single overall message.
    pub fn validation_message(received: serde_json::Value, message: &str) -> Self {
        DocBaseError::Validation {
            received,
            errors: shape_error(message),
        }
    }
}

impl From<crate::store::StoreError> for DocBaseError {
    fn from(error: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match error {
            StoreError::NotFound => DocBaseError::NotFound {
                key: serde_json::Value::Null,
            },
            StoreError::MultipleMatches => DocBaseError::validation_message(
                serde_json::Value::Null,
                "More than one result: Consider another filtering.",
            ),
            StoreError::DuplicateKey { .. } => DocBaseError::validation_message(
                serde_json::Value::Null,
                "This document already exists.",
            ),
            StoreError::Unavailable(message) => DocBaseError::Unavailable(message),
            StoreError::Sqlite(error) => DocBaseError::Sqlite(error),
            StoreError::Json(error) => DocBaseError::Json(error),
            StoreError::Io(error) => DocBaseError::Unavailable(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DocBaseError>;
