//! Outgoing mutation queue
//!
//! Local mutations persist in the store's outbox and upload one at a time.
//! The dispatcher is a single task, so there is never more than one wire
//! mutation outstanding; response errors are settled by the error processor
//! before the next pop, and transport failures halt the queue and surface to
//! the engine.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use remora_proto::{GraphQLRequest, MutationEvent, MutationType, WireClient};
use remora_store::StorageAdapter;

use crate::errors::{Result, SyncError};
use crate::mutation_errors::MutationErrorProcessor;

#[derive(Debug)]
enum QueueCommand {
    Start,
    Pause,
    Shutdown,
}

/// Persists an outbound mutation, coalescing with any pending row for the
/// same record: an update replaces a pending update's payload in place, a
/// pending create absorbs the newer payload and stays a create, and a delete
/// supersedes a pending update. Returns once the row is durable.
pub async fn enqueue(
    store: &dyn StorageAdapter,
    notify: &Notify,
    event: MutationEvent,
) -> Result<()> {
    let pending = store.pending_mutation(&event.model_id).await?;

    let row = match pending {
        Some(existing) if !existing.in_process => match (existing.mutation_type, event.mutation_type) {
            (MutationType::Create, MutationType::Update) => MutationEvent {
                mutation_type: MutationType::Create,
                id: existing.id,
                created_at: existing.created_at,
                ..event
            },
            (MutationType::Update, MutationType::Update)
            | (MutationType::Update, MutationType::Delete) => MutationEvent {
                id: existing.id,
                created_at: existing.created_at,
                ..event
            },
            _ => event,
        },
        _ => event,
    };

    store.enqueue_mutation(&row).await?;
    notify.notify_one();
    Ok(())
}

/// Durable FIFO of local mutations awaiting upload.
pub struct OutgoingMutationQueue {
    commands: mpsc::Sender<QueueCommand>,
    task: JoinHandle<()>,
}

impl OutgoingMutationQueue {
    /// Spawns the dispatcher, paused. Terminal failures are reported on
    /// `failure_tx`.
    pub fn spawn(
        store: Arc<dyn StorageAdapter>,
        wire: Arc<dyn WireClient>,
        processor: Arc<MutationErrorProcessor>,
        notify: Arc<Notify>,
        failure_tx: mpsc::Sender<SyncError>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::channel(8);
        let task = tokio::spawn(dispatch(store, wire, processor, notify, commands_rx, failure_tx));
        Self { commands, task }
    }

    pub async fn start(&self) {
        let _ = self.commands.send(QueueCommand::Start).await;
    }

    /// Halts after the current in-flight mutation completes.
    pub async fn pause(&self) {
        let _ = self.commands.send(QueueCommand::Pause).await;
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(QueueCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

async fn dispatch(
    store: Arc<dyn StorageAdapter>,
    wire: Arc<dyn WireClient>,
    processor: Arc<MutationErrorProcessor>,
    notify: Arc<Notify>,
    mut commands: mpsc::Receiver<QueueCommand>,
    failure_tx: mpsc::Sender<SyncError>,
) {
    let mut running = false;

    loop {
        if !running {
            match commands.recv().await {
                Some(QueueCommand::Start) => {
                    running = true;
                    info!("outgoing mutation queue started");
                }
                Some(QueueCommand::Pause) => {}
                Some(QueueCommand::Shutdown) | None => break,
            }
            continue;
        }

        // Commands win over queued work so pause takes effect between items
        if let Ok(command) = commands.try_recv() {
            match command {
                QueueCommand::Start => {}
                QueueCommand::Pause => {
                    running = false;
                    info!("outgoing mutation queue paused");
                }
                QueueCommand::Shutdown => break,
            }
            continue;
        }

        let head = match store.head_mutation().await {
            Ok(head) => head,
            Err(error) => {
                error!(%error, "failed to read outbox head");
                let _ = failure_tx.send(SyncError::Storage(error)).await;
                running = false;
                continue;
            }
        };

        let Some(event) = head else {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(QueueCommand::Start) => {}
                    Some(QueueCommand::Pause) => {
                        running = false;
                        info!("outgoing mutation queue paused");
                    }
                    Some(QueueCommand::Shutdown) | None => break,
                },
                _ = notify.notified() => {}
            }
            continue;
        };

        if let Err(error) = process_one(store.as_ref(), wire.as_ref(), &processor, &event).await {
            warn!(id = %event.id, %error, "halting outgoing queue");
            let _ = failure_tx.send(error).await;
            running = false;
        }
    }
}

/// Sends one mutation. `Ok` means the event is settled and deleted; `Err`
/// means the transport is down and the event stays queued for the next run.
async fn process_one(
    store: &dyn StorageAdapter,
    wire: &dyn WireClient,
    processor: &MutationErrorProcessor,
    event: &MutationEvent,
) -> Result<()> {
    let payload = match event.decode() {
        Ok(payload) => payload,
        Err(error) => {
            // A row that cannot be decoded will never send; drop it
            error!(id = %event.id, %error, "discarding undecodable mutation");
            store.delete_mutation(&event.id).await?;
            return Ok(());
        }
    };

    store.mark_in_process(&event.id, true).await?;

    let request =
        GraphQLRequest::mutation(&event.model_name, event.mutation_type, &payload, event.version);

    match wire.mutate(request).await {
        Ok(response) if response.is_ok() => {
            debug!(id = %event.id, model_id = %event.model_id, "mutation acknowledged");
        }
        Ok(response) => {
            if let Err(error) = processor.process(event, &response).await {
                error!(id = %event.id, %error, "mutation error processing failed");
            }
        }
        Err(error) => return Err(error.into()),
    }

    store.delete_mutation(&event.id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_store::MemoryStore;
    use serde_json::json;

    fn event(model_id: &str, mutation_type: MutationType, title: &str) -> MutationEvent {
        MutationEvent::new(model_id, "Post", mutation_type, &json!({ "title": title }), None)
            .unwrap()
    }

    #[tokio::test]
    async fn update_coalesces_into_pending_update() {
        let store = MemoryStore::new();
        let notify = Notify::new();

        enqueue(&store, &notify, event("id-1", MutationType::Update, "first")).await.unwrap();
        enqueue(&store, &notify, event("id-1", MutationType::Update, "second")).await.unwrap();

        assert_eq!(store.queue_len().await, 1);
        let head = store.head_mutation().await.unwrap().unwrap();
        assert_eq!(head.mutation_type, MutationType::Update);
        assert_eq!(head.decode().unwrap()["title"], "second");
    }

    #[tokio::test]
    async fn update_folds_into_pending_create() {
        let store = MemoryStore::new();
        let notify = Notify::new();

        enqueue(&store, &notify, event("id-1", MutationType::Create, "first")).await.unwrap();
        enqueue(&store, &notify, event("id-1", MutationType::Update, "second")).await.unwrap();

        assert_eq!(store.queue_len().await, 1);
        let head = store.head_mutation().await.unwrap().unwrap();
        assert_eq!(head.mutation_type, MutationType::Create);
        assert_eq!(head.decode().unwrap()["title"], "second");
    }

    #[tokio::test]
    async fn delete_supersedes_pending_update() {
        let store = MemoryStore::new();
        let notify = Notify::new();

        enqueue(&store, &notify, event("id-1", MutationType::Update, "first")).await.unwrap();
        enqueue(&store, &notify, event("id-1", MutationType::Delete, "gone")).await.unwrap();

        assert_eq!(store.queue_len().await, 1);
        let head = store.head_mutation().await.unwrap().unwrap();
        assert_eq!(head.mutation_type, MutationType::Delete);
    }

    #[tokio::test]
    async fn different_records_never_coalesce() {
        let store = MemoryStore::new();
        let notify = Notify::new();

        enqueue(&store, &notify, event("id-1", MutationType::Update, "a")).await.unwrap();
        enqueue(&store, &notify, event("id-2", MutationType::Update, "b")).await.unwrap();

        assert_eq!(store.queue_len().await, 2);
    }

    #[tokio::test]
    async fn in_process_rows_are_left_alone() {
        let store = MemoryStore::new();
        let notify = Notify::new();

        let first = event("id-1", MutationType::Update, "first");
        enqueue(&store, &notify, first.clone()).await.unwrap();
        store.mark_in_process(&first.id, true).await.unwrap();

        enqueue(&store, &notify, event("id-1", MutationType::Update, "second")).await.unwrap();
        assert_eq!(store.queue_len().await, 2);
    }
}
