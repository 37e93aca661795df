//! Error types for sync operations

use thiserror::Error;

use remora_proto::ProtoError;
use remora_store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("initial sync failed: {0}")]
    InitialSync(String),

    #[error("backend rejected mutation: {0}")]
    Api(String),

    #[error("conflict response carried no remote model")]
    MissingRemoteModel,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether restarting the engine can reasonably clear this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Subscription(_) | Self::InitialSync(_) => true,
            Self::Storage(_)
            | Self::Serialization(_)
            | Self::Api(_)
            | Self::MissingRemoteModel
            | Self::InvariantViolation(_)
            | Self::Cancelled => false,
        }
    }
}

impl From<ProtoError> for SyncError {
    fn from(error: ProtoError) -> Self {
        match error {
            ProtoError::Transport { message, retryable } => Self::Transport { message, retryable },
            ProtoError::Serialization(error) => Self::Serialization(error),
            ProtoError::SubscriptionClosed => Self::Subscription("stream closed".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
