//! Remote sync engine lifecycle
//!
//! The engine composes the incoming queue, the outgoing queue, and the
//! initial sync into one forward-only state machine. A dedicated driver task
//! walks the startup sequence, emits one observer event per transition, and
//! owns the retry decision when a run dies: tear everything down, consult the
//! retry policy, and either restart from scratch or complete the observer
//! stream with the error.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use remora_proto::{MutationEvent, WireClient};
use remora_store::StorageAdapter;

use crate::conflict::ConflictHandler;
use crate::errors::{Result, SyncError};
use crate::events::{EngineEvent, Hub, HubEvent};
use crate::incoming::{IncomingEvent, IncomingEventQueue};
use crate::initial_sync::InitialSyncOrchestrator;
use crate::mutation_errors::{ErrorHandler, MutationErrorProcessor};
use crate::outgoing::{self, OutgoingMutationQueue};
use crate::retry::RetryPolicy;

/// Lifecycle position of the engine. Forward-only within one run; a failure
/// jumps to `CleaningUp` and a restart begins again at `StorageReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    StorageReady,
    SubscriptionsPaused,
    MutationsPaused,
    ClearedMutationState,
    SubscriptionsInitialized,
    InitialSyncDone,
    SubscriptionsActivated,
    MutationQueueStarted,
    Syncing,
    CleaningUp,
    CleanedUp,
    Terminated,
}

#[derive(Debug)]
enum EngineControl {
    Stop(oneshot::Sender<()>),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Model types to synchronize
    pub models: Vec<String>,
    /// Page size for the initial sync query
    pub sync_page_size: u32,
    /// Observer channel capacity
    pub publisher_capacity: usize,
}

impl SyncEngineConfig {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            models,
            sync_page_size: 100,
            publisher_capacity: 256,
        }
    }
}

struct EngineContext {
    config: SyncEngineConfig,
    store: Arc<dyn StorageAdapter>,
    wire: Arc<dyn WireClient>,
    hub: Hub,
    conflict_handler: Arc<dyn ConflictHandler>,
    retry_policy: Arc<dyn RetryPolicy>,
    error_handler: Option<ErrorHandler>,
    notify: Arc<Notify>,
}

/// Top-level synchronization engine.
pub struct RemoteSyncEngine {
    config: SyncEngineConfig,
    store: Arc<dyn StorageAdapter>,
    wire: Arc<dyn WireClient>,
    hub: Hub,
    conflict_handler: Arc<dyn ConflictHandler>,
    retry_policy: Arc<dyn RetryPolicy>,
    error_handler: Option<ErrorHandler>,
    notify: Arc<Notify>,
    control_tx: Option<mpsc::Sender<EngineControl>>,
    driver: Option<JoinHandle<()>>,
}

impl RemoteSyncEngine {
    pub fn new(
        config: SyncEngineConfig,
        store: Arc<dyn StorageAdapter>,
        wire: Arc<dyn WireClient>,
        hub: Hub,
        conflict_handler: Arc<dyn ConflictHandler>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            config,
            store,
            wire,
            hub,
            conflict_handler,
            retry_policy,
            error_handler: None,
            notify: Arc::new(Notify::new()),
            control_tx: None,
            driver: None,
        }
    }

    /// Installs the callback invoked for per-mutation failures that reached a
    /// terminal outcome.
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Queues a local mutation for upload. Durable once this returns; the
    /// dispatcher picks it up whenever the engine is syncing.
    pub async fn submit(&self, event: MutationEvent) -> Result<()> {
        outgoing::enqueue(self.store.as_ref(), &self.notify, event).await
    }

    /// Spawns the driver and returns the observer stream. One event is
    /// emitted per state transition; the stream ends after `Failed` or a
    /// `stop`.
    pub fn start(&mut self) -> Result<mpsc::Receiver<EngineEvent>> {
        if self.driver.is_some() {
            return Err(SyncError::InvariantViolation(
                "engine already started".to_string(),
            ));
        }

        let (publisher_tx, publisher_rx) = mpsc::channel(self.config.publisher_capacity);
        let (control_tx, control_rx) = mpsc::channel(4);

        let context = EngineContext {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            wire: Arc::clone(&self.wire),
            hub: self.hub.clone(),
            conflict_handler: Arc::clone(&self.conflict_handler),
            retry_policy: Arc::clone(&self.retry_policy),
            error_handler: self.error_handler.clone(),
            notify: Arc::clone(&self.notify),
        };

        self.control_tx = Some(control_tx);
        self.driver = Some(tokio::spawn(drive(context, publisher_tx, control_rx)));
        Ok(publisher_rx)
    }

    /// Stops the engine. Returns only after cleanup completes.
    pub async fn stop(&mut self) {
        if let Some(control) = self.control_tx.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if control.send(EngineControl::Stop(ack_tx)).await.is_ok() {
                let _ = ack_rx.await;
            }
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

enum RunOutcome {
    Stopped(Option<oneshot::Sender<()>>),
    Failed(SyncError),
}

async fn drive(
    context: EngineContext,
    publisher: mpsc::Sender<EngineEvent>,
    mut control: mpsc::Receiver<EngineControl>,
) {
    let mut attempt: u32 = 0;

    loop {
        match run_once(&context, &publisher, &mut control).await {
            RunOutcome::Stopped(ack) => {
                info!("sync engine stopped");
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }
            RunOutcome::Failed(cause) => {
                let advice = context.retry_policy.advise(&cause, attempt);
                if advice.retry {
                    attempt += 1;
                    warn!(%cause, attempt, delay = ?advice.delay, "restarting sync engine");
                    tokio::select! {
                        _ = sleep(advice.delay) => continue,
                        command = control.recv() => {
                            info!("sync engine stopped while waiting to restart");
                            if let Some(EngineControl::Stop(ack)) = command {
                                let _ = ack.send(());
                            }
                            break;
                        }
                    }
                } else {
                    error!(%cause, "sync engine terminated");
                    let _ = publisher.send(EngineEvent::Failed(cause)).await;
                    break;
                }
            }
        }
    }

    debug!(state = ?EngineState::Terminated, "engine driver exiting");
}

async fn transition(
    state: &mut EngineState,
    next: EngineState,
    publisher: &mpsc::Sender<EngineEvent>,
    event: EngineEvent,
) {
    debug!(from = ?state, to = ?next, "engine transition");
    *state = next;
    let _ = publisher.send(event).await;
}

/// Tears a run's components down and reports `CleanedUp`.
async fn teardown(
    state: &mut EngineState,
    mut incoming: IncomingEventQueue,
    outgoing_queue: OutgoingMutationQueue,
    publisher: &mpsc::Sender<EngineEvent>,
) {
    debug!(from = ?state, to = ?EngineState::CleaningUp, "engine transition");
    *state = EngineState::CleaningUp;
    incoming.cancel().await;
    outgoing_queue.shutdown().await;
    transition(state, EngineState::CleanedUp, publisher, EngineEvent::CleanedUp).await;
}

async fn run_once(
    context: &EngineContext,
    publisher: &mpsc::Sender<EngineEvent>,
    control: &mut mpsc::Receiver<EngineControl>,
) -> RunOutcome {
    let mut state = EngineState::NotStarted;

    transition(&mut state, EngineState::StorageReady, publisher, EngineEvent::StorageReady).await;

    let mut incoming = match IncomingEventQueue::new(
        &context.config.models,
        Arc::clone(&context.store),
        context.hub.clone(),
        Arc::clone(&context.wire),
    )
    .await
    {
        Ok(incoming) => incoming,
        Err(cause) => {
            let _ = publisher.send(EngineEvent::CleanedUp).await;
            return RunOutcome::Failed(cause);
        }
    };
    let mut incoming_rx = incoming.take_publisher();

    let processor = Arc::new(MutationErrorProcessor::new(
        Arc::clone(&context.store),
        Arc::clone(&context.wire),
        context.hub.clone(),
        Arc::clone(&context.conflict_handler),
        context.error_handler.clone(),
    ));
    let (failure_tx, mut failure_rx) = mpsc::channel(4);
    let outgoing_queue = OutgoingMutationQueue::spawn(
        Arc::clone(&context.store),
        Arc::clone(&context.wire),
        processor,
        Arc::clone(&context.notify),
        failure_tx,
    );

    incoming.pause().await;
    transition(
        &mut state,
        EngineState::SubscriptionsPaused,
        publisher,
        EngineEvent::SubscriptionsPaused,
    )
    .await;

    outgoing_queue.pause().await;
    transition(
        &mut state,
        EngineState::MutationsPaused,
        publisher,
        EngineEvent::MutationsPaused,
    )
    .await;

    if let Err(cause) = context.store.clear_in_process().await {
        teardown(&mut state, incoming, outgoing_queue, publisher).await;
        return RunOutcome::Failed(SyncError::Storage(cause));
    }
    transition(
        &mut state,
        EngineState::ClearedMutationState,
        publisher,
        EngineEvent::ClearedStateOutgoingMutations,
    )
    .await;

    // Wait for every model subscription to reach connected
    loop {
        tokio::select! {
            event = incoming_rx.recv() => match event {
                Some(IncomingEvent::Initialized) => break,
                Some(IncomingEvent::Mutation(mutation)) => {
                    let _ = publisher.send(EngineEvent::MutationEvent(mutation)).await;
                }
                Some(IncomingEvent::Failed(message)) => {
                    teardown(&mut state, incoming, outgoing_queue, publisher).await;
                    return RunOutcome::Failed(SyncError::Subscription(message));
                }
                None => {
                    teardown(&mut state, incoming, outgoing_queue, publisher).await;
                    return RunOutcome::Failed(SyncError::Subscription(
                        "event stream closed before initialization".to_string(),
                    ));
                }
            },
            command = control.recv() => {
                teardown(&mut state, incoming, outgoing_queue, publisher).await;
                return RunOutcome::Stopped(stop_ack(command));
            }
        }
    }
    transition(
        &mut state,
        EngineState::SubscriptionsInitialized,
        publisher,
        EngineEvent::SubscriptionsInitialized,
    )
    .await;

    // Hydrate while keeping the observer stream drained
    let orchestrator = InitialSyncOrchestrator::new(
        context.config.models.clone(),
        Arc::clone(&context.wire),
        incoming.injector(),
        context.config.sync_page_size,
    );
    let mut hydration = tokio::spawn(orchestrator.run());

    let hydration_result = loop {
        tokio::select! {
            joined = &mut hydration => break joined,
            event = incoming_rx.recv() => match event {
                Some(IncomingEvent::Mutation(mutation)) => {
                    let _ = publisher.send(EngineEvent::MutationEvent(mutation)).await;
                }
                Some(IncomingEvent::Initialized) => {}
                Some(IncomingEvent::Failed(message)) => {
                    hydration.abort();
                    teardown(&mut state, incoming, outgoing_queue, publisher).await;
                    return RunOutcome::Failed(SyncError::Subscription(message));
                }
                None => {
                    hydration.abort();
                    teardown(&mut state, incoming, outgoing_queue, publisher).await;
                    return RunOutcome::Failed(SyncError::Subscription(
                        "event stream closed during initial sync".to_string(),
                    ));
                }
            },
            command = control.recv() => {
                hydration.abort();
                teardown(&mut state, incoming, outgoing_queue, publisher).await;
                return RunOutcome::Stopped(stop_ack(command));
            }
        }
    };
    match hydration_result {
        Ok(Ok(())) => {}
        Ok(Err(cause)) => {
            teardown(&mut state, incoming, outgoing_queue, publisher).await;
            return RunOutcome::Failed(cause);
        }
        Err(join_error) => {
            teardown(&mut state, incoming, outgoing_queue, publisher).await;
            return RunOutcome::Failed(SyncError::InitialSync(format!(
                "hydration task died: {join_error}"
            )));
        }
    }

    // Flush changes the hydration already buffered so observers see every
    // hydrated record before the completion transition
    while let Ok(event) = incoming_rx.try_recv() {
        match event {
            IncomingEvent::Mutation(mutation) => {
                let _ = publisher.send(EngineEvent::MutationEvent(mutation)).await;
            }
            IncomingEvent::Initialized => {}
            IncomingEvent::Failed(message) => {
                teardown(&mut state, incoming, outgoing_queue, publisher).await;
                return RunOutcome::Failed(SyncError::Subscription(message));
            }
        }
    }
    transition(
        &mut state,
        EngineState::InitialSyncDone,
        publisher,
        EngineEvent::PerformedInitialSync,
    )
    .await;

    incoming.start().await;
    transition(
        &mut state,
        EngineState::SubscriptionsActivated,
        publisher,
        EngineEvent::SubscriptionsActivated,
    )
    .await;

    outgoing_queue.start().await;
    transition(
        &mut state,
        EngineState::MutationQueueStarted,
        publisher,
        EngineEvent::MutationQueueStarted,
    )
    .await;

    transition(&mut state, EngineState::Syncing, publisher, EngineEvent::SyncStarted).await;
    context.hub.publish(HubEvent::Ready);
    info!(models = context.config.models.len(), "sync engine live");

    // Steady state: republish reconciled changes, watch for terminal errors
    loop {
        tokio::select! {
            event = incoming_rx.recv() => match event {
                Some(IncomingEvent::Mutation(mutation)) => {
                    let _ = publisher.send(EngineEvent::MutationEvent(mutation)).await;
                }
                Some(IncomingEvent::Initialized) => {}
                Some(IncomingEvent::Failed(message)) => {
                    teardown(&mut state, incoming, outgoing_queue, publisher).await;
                    return RunOutcome::Failed(SyncError::Subscription(message));
                }
                None => {
                    teardown(&mut state, incoming, outgoing_queue, publisher).await;
                    return RunOutcome::Failed(SyncError::Subscription(
                        "event stream closed".to_string(),
                    ));
                }
            },
            failure = failure_rx.recv() => {
                let cause = failure.unwrap_or_else(|| SyncError::Subscription(
                    "outgoing queue dropped its failure channel".to_string(),
                ));
                teardown(&mut state, incoming, outgoing_queue, publisher).await;
                return RunOutcome::Failed(cause);
            }
            command = control.recv() => {
                teardown(&mut state, incoming, outgoing_queue, publisher).await;
                return RunOutcome::Stopped(stop_ack(command));
            }
        }
    }
}

fn stop_ack(command: Option<EngineControl>) -> Option<oneshot::Sender<()>> {
    match command {
        Some(EngineControl::Stop(ack)) => Some(ack),
        None => None,
    }
}
