//! Error types for storage operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage quota exceeded writing {key}: need {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record {id} rejected: {reason}")]
    Rejected { id: String, reason: String },
}

impl StoreError {
    /// Whether this error means the local store ran out of capacity
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }

    /// Whether this error means the remote could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
