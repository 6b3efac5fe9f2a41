//! Error types for the state store.

use thiserror::Error;

/// Main error type for state operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state name: {0:?}")]
    InvalidStateName(String),

    #[error("State already initialized: {0}")]
    StateExists(String),

    #[error("Defaults for {0} must serialize to a JSON object")]
    NotAnObject(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("State directory is locked by another writer")]
    Locked,

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Store is closed")]
    Closed,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StoreError>;
