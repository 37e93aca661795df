//! Conflict resolution seam between the engine and application code

use async_trait::async_trait;

use remora_proto::Record;

/// Outcome of a conflict between a local mutation and the authoritative
/// remote state.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Discard the local change and reconcile the store to the remote state
    ApplyRemote,
    /// Re-send the local payload against the remote version
    RetryLocal,
    /// Re-send a caller-supplied payload against the remote version
    Retry(serde_json::Value),
}

/// Application-supplied resolver. Invoked at most once per rejected
/// mutation, with the decoded local payload and the remote record; the
/// returned resolution is acted on exactly once.
#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn resolve(&self, local: &serde_json::Value, remote: &Record) -> ConflictResolution;
}

/// Default handler: the remote state always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyRemoteAlways;

#[async_trait]
impl ConflictHandler for ApplyRemoteAlways {
    async fn resolve(&self, _local: &serde_json::Value, _remote: &Record) -> ConflictResolution {
        ConflictResolution::ApplyRemote
    }
}
