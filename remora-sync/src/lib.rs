//! Offline-first synchronization engine
//!
//! This crate keeps a local store of records reconciled with a remote
//! GraphQL-style backend. It provides:
//! - Per-model reconciliation queues fed by change subscriptions
//! - A persistent outgoing mutation queue with conflict settlement
//! - Paged initial hydration
//! - The top-level engine state machine with restart-on-failure

pub mod conflict;
pub mod engine;
pub mod errors;
pub mod events;
pub mod incoming;
pub mod initial_sync;
pub mod model_queue;
pub mod mutation_errors;
pub mod outgoing;
pub mod reconcile;
pub mod retry;

pub use conflict::{ApplyRemoteAlways, ConflictHandler, ConflictResolution};
pub use engine::{EngineState, RemoteSyncEngine, SyncEngineConfig};
pub use errors::{Result, SyncError};
pub use events::{EngineEvent, Hub, HubEvent};
pub use incoming::{ConnectionState, IncomingEvent, IncomingEventQueue};
pub use initial_sync::InitialSyncOrchestrator;
pub use model_queue::ModelReconciliationQueue;
pub use mutation_errors::{ErrorHandler, MutationErrorProcessor};
pub use outgoing::OutgoingMutationQueue;
pub use retry::{ExponentialBackoff, NoRetry, RetryAdvice, RetryPolicy};
