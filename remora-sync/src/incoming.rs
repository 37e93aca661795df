//! Aggregate of the per-model reconciliation queues
//!
//! Lifts the per-model queues into one publisher stream. A single actor task
//! owns the connection map, so concurrent transitions serialize through its
//! channel and exactly one of them can observe the map becoming fully
//! connected: `Initialized` is emitted once or not at all.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use remora_proto::{MutationEvent, MutationSync, WireClient};
use remora_store::StorageAdapter;

use crate::errors::Result;
use crate::events::Hub;
use crate::model_queue::ModelReconciliationQueue;
use crate::reconcile;

/// Connection state of one model's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Failed,
}

/// Reports from a per-model queue to the aggregate.
#[derive(Debug)]
pub enum ChildEvent {
    Connection {
        model_name: String,
        state: ConnectionState,
    },
    Reconciled(MutationEvent),
    Terminated {
        model_name: String,
        error: Option<String>,
    },
}

/// What the aggregate publishes upward.
#[derive(Debug)]
pub enum IncomingEvent {
    /// Every model's subscription has reached connected for the first time
    Initialized,
    /// A remote event was applied to the store
    Mutation(MutationEvent),
    /// A child failed; the stream ends after this
    Failed(String),
}

/// Applies events through the shared reconcile path and mirrors them on the
/// aggregate publisher. Handed to the initial sync so hydration pages flow
/// through the same funnel as subscription events.
#[derive(Clone)]
pub struct IncomingInjector {
    store: Arc<dyn StorageAdapter>,
    hub: Hub,
    publisher: mpsc::Sender<IncomingEvent>,
}

impl IncomingInjector {
    pub async fn inject(&self, sync: &MutationSync) -> Result<Option<MutationEvent>> {
        let applied = reconcile::reconcile_remote(self.store.as_ref(), &self.hub, sync).await?;
        if let Some(event) = &applied {
            let _ = self.publisher.send(IncomingEvent::Mutation(event.clone())).await;
        }
        Ok(applied)
    }
}

/// Owns one reconciliation queue per registered model and the connection
/// aggregation actor.
pub struct IncomingEventQueue {
    children: Vec<ModelReconciliationQueue>,
    publisher_rx: Option<mpsc::Receiver<IncomingEvent>>,
    publisher_tx: mpsc::Sender<IncomingEvent>,
    store: Arc<dyn StorageAdapter>,
    hub: Hub,
    aggregator: JoinHandle<()>,
}

impl IncomingEventQueue {
    /// Subscribes every model and wires its queue. Queues buffer until
    /// `start`.
    pub async fn new(
        model_names: &[String],
        store: Arc<dyn StorageAdapter>,
        hub: Hub,
        wire: Arc<dyn WireClient>,
    ) -> Result<Self> {
        let (publisher_tx, publisher_rx) = mpsc::channel(256);
        let (child_tx, child_rx) = mpsc::channel(256);

        let mut children = Vec::with_capacity(model_names.len());
        for model_name in model_names {
            let subscription = wire.subscribe(model_name).await?;
            children.push(ModelReconciliationQueue::spawn(
                model_name.clone(),
                Arc::clone(&store),
                hub.clone(),
                subscription,
                child_tx.clone(),
            ));
        }
        drop(child_tx);

        let aggregator = tokio::spawn(aggregate(
            model_names.to_vec(),
            child_rx,
            publisher_tx.clone(),
        ));
        info!(models = model_names.len(), "subscriptions established");

        Ok(Self {
            children,
            publisher_rx: Some(publisher_rx),
            publisher_tx,
            store,
            hub,
            aggregator,
        })
    }

    /// The aggregate event stream. May be taken once.
    pub fn take_publisher(&mut self) -> mpsc::Receiver<IncomingEvent> {
        self.publisher_rx
            .take()
            .expect("publisher already taken")
    }

    pub fn injector(&self) -> IncomingInjector {
        IncomingInjector {
            store: Arc::clone(&self.store),
            hub: self.hub.clone(),
            publisher: self.publisher_tx.clone(),
        }
    }

    /// Queues are created paused; pausing again is an idempotent guard.
    pub async fn pause(&self) {
        debug!(models = self.children.len(), "subscription queues held paused");
    }

    /// Starts draining every model queue.
    pub async fn start(&self) {
        join_all(self.children.iter().map(|child| child.start())).await;
    }

    /// Cancels every child and stops the aggregation actor.
    pub async fn cancel(&mut self) {
        join_all(self.children.iter().map(|child| child.cancel())).await;
        for child in self.children.drain(..) {
            child.join().await;
        }
        self.aggregator.abort();
    }
}

async fn aggregate(
    model_names: Vec<String>,
    mut child_rx: mpsc::Receiver<ChildEvent>,
    publisher: mpsc::Sender<IncomingEvent>,
) {
    let mut connections: HashMap<String, ConnectionState> = model_names
        .into_iter()
        .map(|name| (name, ConnectionState::Disconnected))
        .collect();
    let mut initialized = false;

    // With nothing to connect there is nothing to wait for
    if connections.is_empty() {
        initialized = true;
        let _ = publisher.send(IncomingEvent::Initialized).await;
    }

    while let Some(event) = child_rx.recv().await {
        match event {
            ChildEvent::Connection { model_name, state } => {
                debug!(model = %model_name, ?state, "connection transition");
                connections.insert(model_name.clone(), state);

                if state == ConnectionState::Failed {
                    let _ = publisher
                        .send(IncomingEvent::Failed(format!(
                            "subscription for {model_name} failed"
                        )))
                        .await;
                    break;
                }

                let all_connected = connections
                    .values()
                    .all(|state| *state == ConnectionState::Connected);
                if all_connected && !initialized {
                    initialized = true;
                    info!("all model subscriptions connected");
                    let _ = publisher.send(IncomingEvent::Initialized).await;
                }
            }
            ChildEvent::Reconciled(event) => {
                let _ = publisher.send(IncomingEvent::Mutation(event)).await;
            }
            ChildEvent::Terminated {
                model_name,
                error: Some(message),
            } => {
                warn!(model = %model_name, %message, "model queue terminated");
                let _ = publisher
                    .send(IncomingEvent::Failed(format!("{model_name}: {message}")))
                    .await;
                break;
            }
            ChildEvent::Terminated { error: None, .. } => {}
        }
    }
}
