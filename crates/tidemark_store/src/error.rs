//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store and watermark operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted file could not be parsed or written as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write would violate a uniqueness constraint.
    #[error("unique constraint violated on {table}.{column}")]
    Constraint {
        /// Table name.
        table: String,
        /// Column whose uniqueness was violated.
        column: String,
    },

    /// A range query failed to execute.
    #[error("query on {table} failed: {reason}")]
    QueryFailed {
        /// Table name.
        table: String,
        /// Why the query failed.
        reason: String,
    },

    /// An update keyed by local id matched no row.
    #[error("row {local_id} not found in {table}")]
    RowNotFound {
        /// Table name.
        table: String,
        /// The local id that was looked up.
        local_id: i64,
    },

    /// The store is locked by another process.
    #[error("store is locked: {0}")]
    Locked(String),

    /// The persisted state is corrupted.
    #[error("store corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Returns true if this error is a uniqueness violation.
    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_display_names_the_column() {
        let err = StoreError::Constraint {
            table: "notes".into(),
            column: "server_id".into(),
        };
        assert!(err.is_constraint());
        assert_eq!(err.to_string(), "unique constraint violated on notes.server_id");
    }

    #[test]
    fn io_errors_convert() {
        let err: StoreError = io::Error::new(io::ErrorKind::Other, "disk gone").into();
        assert!(!err.is_constraint());
        assert!(err.to_string().contains("disk gone"));
    }
}
