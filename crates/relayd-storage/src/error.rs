//! Error types for the storage crate.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage/Database error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Not found error.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl From<StorageError> for relayd_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(e) => relayd_core::Error::Storage(e.to_string()),
            StorageError::Serialization(s) => relayd_core::Error::Serialization(s),
            StorageError::Storage(s) => relayd_core::Error::Storage(s),
            StorageError::NotFound(s) => relayd_core::Error::NotFound(s),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<redb::Error> for StorageError {
    fn from(e: redb::Error) -> Self {
        StorageError::Storage(format!("Redb error: {}", e))
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        StorageError::Storage(format!("Redb transaction error: {}", e))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        StorageError::Storage(format!("Redb table error: {}", e))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        StorageError::Storage(format!("Redb storage error: {}", e))
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        StorageError::Storage(format!("Redb commit error: {}", e))
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        StorageError::Storage(format!("Redb database error: {}", e))
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Storage(format!("Task join error: {}", e))
    }
}
