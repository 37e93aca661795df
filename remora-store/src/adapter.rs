//! Storage contract consumed by the sync engine

use async_trait::async_trait;

use remora_proto::{MutationEvent, Record, SyncMetadata};

use crate::errors::Result;

/// Transactional key/value plus metadata adapter backing the engine. Each
/// operation is atomic on its own; the engine never relies on multi-statement
/// transactions.
///
/// Three families of rows live here: record rows keyed by model and id,
/// one sync-metadata row per record id, and the outbox of pending local
/// mutations awaiting upload.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn save_record(&self, record: &Record) -> Result<()>;

    async fn get_record(&self, model_name: &str, id: &str) -> Result<Option<Record>>;

    /// Removes the record row. Removing an absent row is not an error.
    async fn delete_record(&self, model_name: &str, id: &str) -> Result<()>;

    async fn query_records(&self, model_name: &str) -> Result<Vec<Record>>;

    async fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()>;

    async fn get_metadata(&self, id: &str) -> Result<Option<SyncMetadata>>;

    /// Persists an outbound mutation, replacing any row with the same id.
    async fn enqueue_mutation(&self, event: &MutationEvent) -> Result<()>;

    /// Oldest pending mutation, by creation time then insertion order.
    async fn head_mutation(&self) -> Result<Option<MutationEvent>>;

    /// Pending mutation targeting the given record, if any.
    async fn pending_mutation(&self, model_id: &str) -> Result<Option<MutationEvent>>;

    async fn mark_in_process(&self, id: &str, in_process: bool) -> Result<()>;

    async fn delete_mutation(&self, id: &str) -> Result<()>;

    /// Clears the in-process flag on every queued mutation. Run at startup so
    /// work left in flight by a previous process is dispatched again.
    async fn clear_in_process(&self) -> Result<()>;
}
