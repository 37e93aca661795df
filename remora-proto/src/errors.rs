//! Error types for wire operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("subscription closed")]
    SubscriptionClosed,
}

impl ProtoError {
    /// Builds a retryable transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Builds a transport error the caller should not retry.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether retrying the operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Serialization(_) => false,
            Self::SubscriptionClosed => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
