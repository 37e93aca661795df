//! Settling error responses for outgoing mutations
//!
//! Classifies the backend's rejection of one mutation and reconciles the
//! local store with either the remote state or a retried local payload.
//! Every input completes: an unclassifiable error goes to the application's
//! error handler instead of leaving the mutation hanging.

use std::sync::Arc;

use tracing::{debug, info, warn};

use remora_proto::{GraphQLRequest, GraphQLResponse, MutationEvent, MutationSync, MutationType, WireClient};
use remora_store::StorageAdapter;

use crate::conflict::{ConflictHandler, ConflictResolution};
use crate::errors::{Result, SyncError};
use crate::events::{Hub, HubEvent};
use crate::reconcile;

/// Callback invoked with per-mutation failures that reached a terminal
/// outcome.
pub type ErrorHandler = Arc<dyn Fn(SyncError) + Send + Sync>;

/// Per-mutation error state machine.
pub struct MutationErrorProcessor {
    store: Arc<dyn StorageAdapter>,
    wire: Arc<dyn WireClient>,
    hub: Hub,
    conflict_handler: Arc<dyn ConflictHandler>,
    error_handler: Option<ErrorHandler>,
}

impl MutationErrorProcessor {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        wire: Arc<dyn WireClient>,
        hub: Hub,
        conflict_handler: Arc<dyn ConflictHandler>,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        Self {
            store,
            wire,
            hub,
            conflict_handler,
            error_handler,
        }
    }

    /// Settles one rejected mutation. `Ok` means the error was absorbed and
    /// the queue can move on; `Err` is logged by the caller and the queue
    /// still moves on.
    pub async fn process(&self, event: &MutationEvent, response: &GraphQLResponse) -> Result<()> {
        let Some(error) = response.single_error() else {
            debug!(
                id = %event.id,
                errors = response.errors.len(),
                "response is not a single-error rejection, nothing actionable"
            );
            return Ok(());
        };

        if error.is_conditional_check() {
            info!(model_id = %event.model_id, "conditional save failed");
            self.hub.publish(HubEvent::ConditionalSaveFailed(event.clone()));
            return Ok(());
        }

        if error.is_unhandled_conflict() {
            let remote = error.remote_model().ok_or(SyncError::MissingRemoteModel)?;
            return self.resolve_conflict(event, remote).await;
        }

        // Unclassified rejection: surface it and consume the mutation
        self.report(SyncError::Api(error.message.clone()));
        Ok(())
    }

    async fn resolve_conflict(&self, event: &MutationEvent, remote: MutationSync) -> Result<()> {
        match event.mutation_type {
            MutationType::Create => Err(SyncError::InvariantViolation(
                "create mutations cannot conflict".to_string(),
            )),
            MutationType::Delete if remote.metadata.deleted => {
                // Deleted on both sides, nothing to reconcile
                debug!(model_id = %event.model_id, "delete already applied remotely");
                Ok(())
            }
            MutationType::Delete => {
                // The record outlived our delete; restore it locally
                info!(model_id = %event.model_id, "remote outlived local delete, restoring");
                reconcile::apply_remote(self.store.as_ref(), &self.hub, &remote).await?;
                Ok(())
            }
            MutationType::Update if remote.metadata.deleted => {
                info!(model_id = %event.model_id, "remote deleted under local update");
                reconcile::apply_remote(self.store.as_ref(), &self.hub, &remote).await?;
                Ok(())
            }
            MutationType::Update => {
                let local = event.decode()?;
                let resolution = self.conflict_handler.resolve(&local, &remote.record).await;
                debug!(model_id = %event.model_id, ?resolution, "conflict resolved by handler");

                match resolution {
                    ConflictResolution::ApplyRemote => {
                        reconcile::apply_remote(self.store.as_ref(), &self.hub, &remote).await?;
                        Ok(())
                    }
                    ConflictResolution::RetryLocal => {
                        self.retry_mutation(event, local, remote.metadata.version).await
                    }
                    ConflictResolution::Retry(payload) => {
                        self.retry_mutation(event, payload, remote.metadata.version).await
                    }
                }
            }
        }
    }

    /// Re-sends the mutation against the remote version. Further rejections
    /// go to the error handler rather than back through classification.
    async fn retry_mutation(
        &self,
        event: &MutationEvent,
        payload: serde_json::Value,
        expected_version: u64,
    ) -> Result<()> {
        let request = GraphQLRequest::mutation(
            &event.model_name,
            event.mutation_type,
            &payload,
            Some(expected_version),
        );

        match self.wire.mutate(request).await {
            Ok(response) if response.is_ok() => {
                debug!(model_id = %event.model_id, "conflict retry acknowledged");
            }
            Ok(response) => {
                let message = response
                    .errors
                    .first()
                    .map(|error| error.message.clone())
                    .unwrap_or_else(|| "rejected without detail".to_string());
                self.report(SyncError::Api(message));
            }
            Err(error) => self.report(error.into()),
        }
        Ok(())
    }

    fn report(&self, error: SyncError) {
        warn!(%error, "mutation reached a terminal failure");
        if let Some(handler) = &self.error_handler {
            handler(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ApplyRemoteAlways;
    use async_trait::async_trait;
    use remora_proto::{
        GraphQLError, MockWireClient, Record, SyncMetadata, ERROR_TYPE_CONDITIONAL_CHECK,
        ERROR_TYPE_CONFLICT_UNHANDLED,
    };
    use remora_store::MemoryStore;
    use serde_json::json;

    struct RetryLocalHandler;

    #[async_trait]
    impl ConflictHandler for RetryLocalHandler {
        async fn resolve(&self, _local: &serde_json::Value, _remote: &Record) -> ConflictResolution {
            ConflictResolution::RetryLocal
        }
    }

    /// Records every invocation so tests can assert the at-most-once contract.
    #[derive(Default)]
    struct RecordingHandler {
        calls: std::sync::Mutex<Vec<(serde_json::Value, serde_json::Value)>>,
    }

    #[async_trait]
    impl ConflictHandler for RecordingHandler {
        async fn resolve(&self, local: &serde_json::Value, remote: &Record) -> ConflictResolution {
            self.calls
                .lock()
                .unwrap()
                .push((local.clone(), remote.payload.clone()));
            ConflictResolution::ApplyRemote
        }
    }

    fn processor(
        store: &MemoryStore,
        wire: &MockWireClient,
        hub: &Hub,
        handler: Arc<dyn ConflictHandler>,
    ) -> MutationErrorProcessor {
        MutationErrorProcessor::new(
            Arc::new(store.clone()),
            Arc::new(wire.clone()),
            hub.clone(),
            handler,
            None,
        )
    }

    fn local_update(title: &str) -> MutationEvent {
        MutationEvent::new(
            "id-1",
            "Post",
            MutationType::Update,
            &json!({ "title": title }),
            Some(1),
        )
        .unwrap()
    }

    fn remote(title: &str, version: u64, deleted: bool) -> MutationSync {
        MutationSync::new(
            Record::new("id-1", "Post", json!({ "title": title })),
            SyncMetadata {
                id: "id-1".to_string(),
                model_name: "Post".to_string(),
                version,
                last_changed_at: 1_700_000_000,
                deleted,
            },
        )
    }

    fn conflict_response(remote: &MutationSync) -> GraphQLResponse {
        GraphQLResponse::from_error(
            GraphQLError::new("version mismatch", Some(ERROR_TYPE_CONFLICT_UNHANDLED))
                .with_remote(remote),
        )
    }

    #[tokio::test]
    async fn conditional_check_publishes_and_absorbs() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let mut bus = hub.subscribe();
        let processor = processor(&store, &wire, &hub, Arc::new(ApplyRemoteAlways));

        let response = GraphQLResponse::from_error(GraphQLError::new(
            "stale version",
            Some(ERROR_TYPE_CONDITIONAL_CHECK),
        ));
        processor.process(&local_update("local"), &response).await.unwrap();

        match bus.try_recv().unwrap() {
            HubEvent::ConditionalSaveFailed(event) => assert_eq!(event.model_id, "id-1"),
            other => panic!("unexpected hub event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn apply_remote_resolution_reconciles_store() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let mut bus = hub.subscribe();
        let handler = Arc::new(RecordingHandler::default());
        let processor = processor(&store, &wire, &hub, handler.clone());

        let remote = remote("remote", 2, false);
        processor
            .process(&local_update("local"), &conflict_response(&remote))
            .await
            .unwrap();

        // Handler saw both payloads, exactly once
        let calls = handler.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0["title"], "local");
        assert_eq!(calls[0].1["title"], "remote");

        let record = store.get_record("Post", "id-1").await.unwrap().unwrap();
        assert_eq!(record.payload["title"], "remote");
        let metadata = store.get_metadata("id-1").await.unwrap().unwrap();
        assert_eq!(metadata.version, 2);
        assert!(!metadata.deleted);

        assert!(matches!(bus.try_recv().unwrap(), HubEvent::SyncReceived(_)));
        assert!(bus.try_recv().is_err());
        // No retry was sent upstream
        assert!(wire.mutations().is_empty());
    }

    #[tokio::test]
    async fn retry_local_resends_with_remote_version() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let processor = processor(&store, &wire, &hub, Arc::new(RetryLocalHandler));

        let remote = remote("remote", 2, false);
        processor
            .process(&local_update("local"), &conflict_response(&remote))
            .await
            .unwrap();

        let sent = wire.mutations();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].input().unwrap()["title"], "local");
        assert_eq!(sent[0].expected_version(), Some(2));
    }

    #[tokio::test]
    async fn delete_conflict_with_live_remote_restores_record() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let processor = processor(&store, &wire, &hub, Arc::new(ApplyRemoteAlways));

        let event = MutationEvent::new(
            "id-1",
            "Post",
            MutationType::Delete,
            &json!({ "title": "doomed" }),
            Some(1),
        )
        .unwrap();
        let remote = remote("survivor", 3, false);
        processor.process(&event, &conflict_response(&remote)).await.unwrap();

        let record = store.get_record("Post", "id-1").await.unwrap().unwrap();
        assert_eq!(record.payload["title"], "survivor");
    }

    #[tokio::test]
    async fn update_conflict_with_deleted_remote_tombstones() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let processor = processor(&store, &wire, &hub, Arc::new(ApplyRemoteAlways));

        store
            .save_record(&Record::new("id-1", "Post", json!({ "title": "local" })))
            .await
            .unwrap();

        let remote = remote("irrelevant", 4, true);
        processor
            .process(&local_update("local"), &conflict_response(&remote))
            .await
            .unwrap();

        assert_eq!(store.get_record("Post", "id-1").await.unwrap(), None);
        let metadata = store.get_metadata("id-1").await.unwrap().unwrap();
        assert!(metadata.deleted);
        assert_eq!(metadata.version, 4);
    }

    #[tokio::test]
    async fn conflict_on_create_is_an_invariant_violation() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let processor = processor(&store, &wire, &hub, Arc::new(ApplyRemoteAlways));

        let event =
            MutationEvent::new("id-1", "Post", MutationType::Create, &json!({}), None).unwrap();
        let remote = remote("remote", 2, false);
        let result = processor.process(&event, &conflict_response(&remote)).await;

        assert!(matches!(result, Err(SyncError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn conflict_without_remote_model_is_an_error() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let processor = processor(&store, &wire, &hub, Arc::new(ApplyRemoteAlways));

        let response = GraphQLResponse::from_error(GraphQLError::new(
            "diverged",
            Some(ERROR_TYPE_CONFLICT_UNHANDLED),
        ));
        let result = processor.process(&local_update("local"), &response).await;

        assert!(matches!(result, Err(SyncError::MissingRemoteModel)));
    }

    #[tokio::test]
    async fn unclassified_errors_reach_the_error_handler_and_complete() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);

        let processor = MutationErrorProcessor::new(
            Arc::new(store.clone()),
            Arc::new(wire.clone()),
            hub.clone(),
            Arc::new(ApplyRemoteAlways),
            Some(Arc::new(move |error| {
                sink.lock().unwrap().push(error.to_string());
            })),
        );

        let response =
            GraphQLResponse::from_error(GraphQLError::new("quota exceeded", Some("Throttled")));
        processor.process(&local_update("local"), &response).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("quota exceeded"));
    }

    #[tokio::test]
    async fn multi_error_responses_are_not_actionable() {
        let store = MemoryStore::new();
        let wire = MockWireClient::new();
        let hub = Hub::default();
        let processor = processor(&store, &wire, &hub, Arc::new(ApplyRemoteAlways));

        let mut response = GraphQLResponse::from_error(GraphQLError::new("one", None));
        response.errors.push(GraphQLError::new("two", None));

        processor.process(&local_update("local"), &response).await.unwrap();
        assert!(wire.mutations().is_empty());
    }
}
