//! Store errors

use thiserror::Error;

/// Errors from a storage engine
///
/// These are operational failures. Financial anomalies are never errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid stored value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Injected failure: {0}")]
    Injected(String),

    #[error("Internal store error: {0}")]
    Internal(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid_value(field: &str, value: impl ToString) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = StoreError::not_found("Wallet", 42);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Record not found: Wallet with id 42");
    }

    #[test]
    fn test_invalid_value_error() {
        let err = StoreError::invalid_value("balance", "abc");
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("balance = abc"));
    }
}
