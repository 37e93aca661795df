//! Engine observer events and the application event bus

use tokio::sync::broadcast;
use tracing::trace;

use remora_proto::MutationEvent;

use crate::errors::SyncError;

/// One entry on the engine's observer stream. Lifecycle variants mirror the
/// startup sequence; `MutationEvent` carries each reconciled remote change,
/// and `Failed` terminates the stream.
#[derive(Debug)]
pub enum EngineEvent {
    StorageReady,
    SubscriptionsPaused,
    MutationsPaused,
    ClearedStateOutgoingMutations,
    SubscriptionsInitialized,
    PerformedInitialSync,
    SubscriptionsActivated,
    MutationQueueStarted,
    SyncStarted,
    CleanedUp,
    MutationEvent(MutationEvent),
    Failed(SyncError),
}

impl EngineEvent {
    /// Stable name for assertions and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StorageReady => "StorageReady",
            Self::SubscriptionsPaused => "SubscriptionsPaused",
            Self::MutationsPaused => "MutationsPaused",
            Self::ClearedStateOutgoingMutations => "ClearedStateOutgoingMutations",
            Self::SubscriptionsInitialized => "SubscriptionsInitialized",
            Self::PerformedInitialSync => "PerformedInitialSync",
            Self::SubscriptionsActivated => "SubscriptionsActivated",
            Self::MutationQueueStarted => "MutationQueueStarted",
            Self::SyncStarted => "SyncStarted",
            Self::CleanedUp => "CleanedUp",
            Self::MutationEvent(_) => "MutationEvent",
            Self::Failed(_) => "Failed",
        }
    }
}

/// Events published to the application.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A remote change was applied to the local store
    SyncReceived(MutationEvent),
    /// The backend rejected a mutation because its expected version was stale
    ConditionalSaveFailed(MutationEvent),
    /// The engine finished startup and is live
    Ready,
}

impl HubEvent {
    /// Dotted topic name the application subscribes under.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::SyncReceived(_) => "DataStore.syncReceived",
            Self::ConditionalSaveFailed(_) => "DataStore.conditionalSaveFailed",
            Self::Ready => "DataStore.ready",
        }
    }
}

/// Broadcast bus the application observes. Constructed at engine init and
/// passed by reference; lagging subscribers drop the oldest events.
#[derive(Debug, Clone)]
pub struct Hub {
    tx: broadcast::Sender<HubEvent>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Publishes without caring whether anyone is listening.
    pub fn publish(&self, event: HubEvent) {
        trace!(topic = event.topic(), "hub event");
        let _ = self.tx.send(event);
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_delivers_to_subscribers() {
        let hub = Hub::default();
        let mut rx = hub.subscribe();

        hub.publish(HubEvent::Ready);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "DataStore.ready");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        Hub::default().publish(HubEvent::Ready);
    }
}
