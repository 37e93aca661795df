//! Per-model reconciliation queue
//!
//! One queue per model type owns that model's subscription stream and applies
//! incoming payloads to the store strictly in arrival order. The queue is
//! created subscribed but dormant: payloads buffer in memory until `start`,
//! then the backlog drains FIFO before newly arriving events.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use remora_proto::{MutationSync, Subscription, SubscriptionConnectionState, SubscriptionEvent};
use remora_store::StorageAdapter;

use crate::events::Hub;
use crate::incoming::{ChildEvent, ConnectionState};
use crate::reconcile;

#[derive(Debug)]
enum QueueCommand {
    Start,
    Cancel,
}

/// FIFO queue applying one model's remote events to the local store, at most
/// one application in flight.
pub struct ModelReconciliationQueue {
    model_name: String,
    commands: mpsc::Sender<QueueCommand>,
    task: JoinHandle<()>,
}

impl ModelReconciliationQueue {
    /// Spawns the driver task for `subscription`. Reconciled events and
    /// connection transitions are reported on `child_tx`.
    pub fn spawn(
        model_name: impl Into<String>,
        store: Arc<dyn StorageAdapter>,
        hub: Hub,
        subscription: Subscription,
        child_tx: mpsc::Sender<ChildEvent>,
    ) -> Self {
        let model_name = model_name.into();
        let (commands, commands_rx) = mpsc::channel(8);

        let task = tokio::spawn(drive(
            model_name.clone(),
            store,
            hub,
            subscription,
            commands_rx,
            child_tx,
        ));

        Self {
            model_name,
            commands,
            task,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Begins draining. Buffered events are applied before new arrivals.
    pub async fn start(&self) {
        let _ = self.commands.send(QueueCommand::Start).await;
    }

    /// Drops the subscription and abandons any buffered work.
    pub async fn cancel(&self) {
        let _ = self.commands.send(QueueCommand::Cancel).await;
    }

    /// Waits for the driver task to finish after a cancel.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn drive(
    model_name: String,
    store: Arc<dyn StorageAdapter>,
    hub: Hub,
    mut subscription: Subscription,
    mut commands: mpsc::Receiver<QueueCommand>,
    child_tx: mpsc::Sender<ChildEvent>,
) {
    let mut started = false;
    let mut buffer: VecDeque<MutationSync> = VecDeque::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(QueueCommand::Start) => {
                    started = true;
                    debug!(model = %model_name, buffered = buffer.len(), "queue started");
                    while let Some(sync) = buffer.pop_front() {
                        process(&model_name, store.as_ref(), &hub, &child_tx, sync).await;
                    }
                }
                Some(QueueCommand::Cancel) | None => {
                    subscription.cancel();
                    debug!(model = %model_name, "queue cancelled");
                    break;
                }
            },
            event = subscription.next_event() => match event {
                Some(SubscriptionEvent::Connection(state)) => {
                    let state = map_connection(state);
                    let _ = child_tx
                        .send(ChildEvent::Connection { model_name: model_name.clone(), state })
                        .await;
                }
                Some(SubscriptionEvent::Data(sync)) => {
                    if started {
                        process(&model_name, store.as_ref(), &hub, &child_tx, sync).await;
                    } else {
                        buffer.push_back(sync);
                    }
                }
                Some(SubscriptionEvent::Completed) => {
                    warn!(model = %model_name, "subscription completed upstream");
                    let _ = child_tx
                        .send(ChildEvent::Terminated {
                            model_name: model_name.clone(),
                            error: Some("subscription completed upstream".to_string()),
                        })
                        .await;
                    break;
                }
                Some(SubscriptionEvent::Failed(message)) => {
                    warn!(model = %model_name, %message, "subscription failed");
                    let _ = child_tx
                        .send(ChildEvent::Terminated {
                            model_name: model_name.clone(),
                            error: Some(message),
                        })
                        .await;
                    break;
                }
                None => {
                    let _ = child_tx
                        .send(ChildEvent::Terminated {
                            model_name: model_name.clone(),
                            error: Some("subscription stream closed".to_string()),
                        })
                        .await;
                    break;
                }
            },
        }
    }
}

/// Applies one event and reports it. Store failures are absorbed so one bad
/// record cannot stall the stream.
async fn process(
    model_name: &str,
    store: &dyn StorageAdapter,
    hub: &Hub,
    child_tx: &mpsc::Sender<ChildEvent>,
    sync: MutationSync,
) {
    match reconcile::reconcile_remote(store, hub, &sync).await {
        Ok(Some(event)) => {
            let _ = child_tx.send(ChildEvent::Reconciled(event)).await;
        }
        Ok(None) => {}
        Err(error) => {
            error!(
                model = %model_name,
                id = %sync.metadata.id,
                %error,
                "failed to apply remote event, continuing"
            );
        }
    }
}

fn map_connection(state: SubscriptionConnectionState) -> ConnectionState {
    match state {
        SubscriptionConnectionState::Connected => ConnectionState::Connected,
        SubscriptionConnectionState::Connecting | SubscriptionConnectionState::Disconnected => {
            ConnectionState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_proto::{MockWireClient, Record, SyncMetadata, WireClient};
    use remora_store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn sync(id: &str, version: u64) -> MutationSync {
        MutationSync::new(
            Record::new(id, "Post", json!({ "title": id })),
            SyncMetadata {
                id: id.to_string(),
                model_name: "Post".to_string(),
                version,
                last_changed_at: 0,
                deleted: false,
            },
        )
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn buffers_until_started_then_drains_in_order() {
        let wire = MockWireClient::new();
        let store = MemoryStore::new();
        let hub = Hub::default();
        let (child_tx, mut child_rx) = mpsc::channel(32);

        let subscription = wire.subscribe("Post").await.unwrap();
        let queue = ModelReconciliationQueue::spawn(
            "Post",
            Arc::new(store.clone()),
            hub,
            subscription,
            child_tx,
        );

        for id in ["id-1", "id-2", "id-3"] {
            assert!(wire.emit("Post", SubscriptionEvent::Data(sync(id, 1))).await);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.journal().await.is_empty());

        queue.start().await;
        wait_for(|| {
            let store = store.clone();
            async move { store.record_count().await == 3 }
        })
        .await;

        assert_eq!(
            store.journal().await,
            vec![
                "save_record:Post/id-1",
                "save_metadata:Post/id-1",
                "save_record:Post/id-2",
                "save_metadata:Post/id-2",
                "save_record:Post/id-3",
                "save_metadata:Post/id-3",
            ]
        );

        for _ in 0..3 {
            assert!(matches!(child_rx.recv().await, Some(ChildEvent::Reconciled(_))));
        }

        queue.cancel().await;
        queue.join().await;
    }

    #[tokio::test]
    async fn connection_transitions_are_forwarded() {
        let wire = MockWireClient::new();
        let (child_tx, mut child_rx) = mpsc::channel(8);

        let subscription = wire.subscribe("Post").await.unwrap();
        let queue = ModelReconciliationQueue::spawn(
            "Post",
            Arc::new(MemoryStore::new()),
            Hub::default(),
            subscription,
            child_tx,
        );

        assert!(wire.connect("Post").await);
        match child_rx.recv().await {
            Some(ChildEvent::Connection { model_name, state }) => {
                assert_eq!(model_name, "Post");
                assert_eq!(state, ConnectionState::Connected);
            }
            other => panic!("unexpected child event: {other:?}"),
        }

        queue.cancel().await;
        queue.join().await;
    }

    #[tokio::test]
    async fn upstream_failure_terminates_with_error() {
        let wire = MockWireClient::new();
        let (child_tx, mut child_rx) = mpsc::channel(8);

        let subscription = wire.subscribe("Post").await.unwrap();
        let queue = ModelReconciliationQueue::spawn(
            "Post",
            Arc::new(MemoryStore::new()),
            Hub::default(),
            subscription,
            child_tx,
        );

        assert!(wire.emit("Post", SubscriptionEvent::Failed("torn down".to_string())).await);
        match child_rx.recv().await {
            Some(ChildEvent::Terminated { error: Some(message), .. }) => {
                assert_eq!(message, "torn down");
            }
            other => panic!("unexpected child event: {other:?}"),
        }

        queue.join().await;
    }
}
