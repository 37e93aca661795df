//! Applying remote state to the local store
//!
//! Both the subscription queues and the mutation error processor funnel
//! through these two functions, so every remote write follows the same
//! discipline: record row first, metadata row last. A crash between the two
//! writes leaves the old version in place and the event re-applies cleanly.

use tracing::debug;

use remora_proto::{MutationEvent, MutationSync};
use remora_store::StorageAdapter;

use crate::errors::Result;
use crate::events::{Hub, HubEvent};

/// Applies `remote` unconditionally: upsert or delete the record row per the
/// tombstone flag, write the metadata, then announce the change.
pub async fn apply_remote(
    store: &dyn StorageAdapter,
    hub: &Hub,
    remote: &MutationSync,
) -> Result<MutationEvent> {
    let metadata = &remote.metadata;

    if metadata.deleted {
        store
            .delete_record(&metadata.model_name, &metadata.id)
            .await?;
    } else {
        store.save_record(&remote.record).await?;
    }
    store.save_metadata(metadata).await?;

    let event = MutationEvent::from_remote(remote)?;
    hub.publish(HubEvent::SyncReceived(event.clone()));
    Ok(event)
}

/// Version-gated apply for subscription and initial-sync events. Events at
/// or below the stored version are dropped; applying the same payload twice
/// is therefore a no-op.
pub async fn reconcile_remote(
    store: &dyn StorageAdapter,
    hub: &Hub,
    remote: &MutationSync,
) -> Result<Option<MutationEvent>> {
    if let Some(current) = store.get_metadata(&remote.metadata.id).await? {
        if remote.metadata.version <= current.version {
            debug!(
                id = %remote.metadata.id,
                incoming = remote.metadata.version,
                current = current.version,
                "dropping stale remote event"
            );
            return Ok(None);
        }
    }

    apply_remote(store, hub, remote).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_proto::{MutationType, Record, SyncMetadata};
    use remora_store::MemoryStore;
    use serde_json::json;

    fn sync(id: &str, version: u64, deleted: bool, title: &str) -> MutationSync {
        MutationSync::new(
            Record::new(id, "Post", json!({ "title": title })),
            SyncMetadata {
                id: id.to_string(),
                model_name: "Post".to_string(),
                version,
                last_changed_at: 1_700_000_000,
                deleted,
            },
        )
    }

    #[tokio::test]
    async fn update_after_delete_is_dropped() {
        let store = MemoryStore::new();
        let hub = Hub::default();

        store
            .save_metadata(&sync("id-1", 2, true, "gone").metadata)
            .await
            .unwrap();

        let applied = reconcile_remote(&store, &hub, &sync("id-1", 1, false, "late"))
            .await
            .unwrap();

        assert!(applied.is_none());
        assert_eq!(store.get_record("Post", "id-1").await.unwrap(), None);
        let metadata = store.get_metadata("id-1").await.unwrap().unwrap();
        assert_eq!(metadata.version, 2);
        assert!(metadata.deleted);
    }

    #[tokio::test]
    async fn delete_without_local_record_writes_tombstone_only() {
        let store = MemoryStore::new();
        let hub = Hub::default();
        let mut bus = hub.subscribe();

        let applied = reconcile_remote(&store, &hub, &sync("id-1", 2, true, "gone"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(applied.mutation_type, MutationType::Delete);
        assert_eq!(store.get_record("Post", "id-1").await.unwrap(), None);
        let metadata = store.get_metadata("id-1").await.unwrap().unwrap();
        assert_eq!(metadata.version, 2);
        assert!(metadata.deleted);

        assert!(matches!(bus.try_recv().unwrap(), HubEvent::SyncReceived(_)));
        assert!(bus.try_recv().is_err());
    }

    #[tokio::test]
    async fn metadata_is_written_after_the_record() {
        let store = MemoryStore::new();
        let hub = Hub::default();

        reconcile_remote(&store, &hub, &sync("id-1", 1, false, "hello"))
            .await
            .unwrap();

        assert_eq!(
            store.journal().await,
            vec!["save_record:Post/id-1", "save_metadata:Post/id-1"]
        );
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let store = MemoryStore::new();
        let hub = Hub::default();
        let event = sync("id-1", 3, false, "same");

        let first = reconcile_remote(&store, &hub, &event).await.unwrap();
        assert!(first.is_some());
        let record_after_first = store.get_record("Post", "id-1").await.unwrap();
        let metadata_after_first = store.get_metadata("id-1").await.unwrap();

        let second = reconcile_remote(&store, &hub, &event).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.get_record("Post", "id-1").await.unwrap(), record_after_first);
        assert_eq!(store.get_metadata("id-1").await.unwrap(), metadata_after_first);
    }

    #[tokio::test]
    async fn newer_version_replaces_record() {
        let store = MemoryStore::new();
        let hub = Hub::default();

        reconcile_remote(&store, &hub, &sync("id-1", 1, false, "old"))
            .await
            .unwrap();
        let applied = reconcile_remote(&store, &hub, &sync("id-1", 2, false, "new"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(applied.mutation_type, MutationType::Update);
        let record = store.get_record("Post", "id-1").await.unwrap().unwrap();
        assert_eq!(record.payload["title"], "new");
        assert_eq!(store.get_metadata("id-1").await.unwrap().unwrap().version, 2);
    }
}
