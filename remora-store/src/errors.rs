//! Error types for storage operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown mutation type: {0}")]
    UnknownMutationType(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
