//! Wire client contract and the scriptable in-memory client used by tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::errors::Result;
use crate::model::MutationSync;
use crate::request::{GraphQLRequest, GraphQLResponse, SyncPage};

/// Connection lifecycle of a subscription as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// One delivery on a subscription stream.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Connection(SubscriptionConnectionState),
    Data(MutationSync),
    /// The stream finished normally on the transport side
    Completed,
    /// The stream finished with a transport failure
    Failed(String),
}

/// A long-lived subscription stream handle. Events arrive on an internal
/// channel; `cancel` tells the transport to tear the stream down and is
/// idempotent.
#[derive(Debug)]
pub struct Subscription {
    model_name: String,
    events: mpsc::Receiver<SubscriptionEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(
        model_name: impl Into<String>,
        events: mpsc::Receiver<SubscriptionEvent>,
        cancel_tx: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            events,
            cancel_tx,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Waits for the next event. Returns `None` once the stream is closed.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        self.events.close();
    }
}

/// GraphQL-style transport consumed by the sync engine: one-shot queries and
/// mutations plus long-lived change subscriptions.
#[async_trait]
pub trait WireClient: Send + Sync {
    async fn query(&self, request: GraphQLRequest) -> Result<GraphQLResponse>;

    async fn mutate(&self, request: GraphQLRequest) -> Result<GraphQLResponse>;

    async fn subscribe(&self, model_name: &str) -> Result<Subscription>;
}

#[derive(Default)]
struct MockInner {
    query_responses: VecDeque<Result<GraphQLResponse>>,
    mutate_responses: VecDeque<Result<GraphQLResponse>>,
    queries: Vec<GraphQLRequest>,
    mutations: Vec<GraphQLRequest>,
    subscription_requests: Vec<GraphQLRequest>,
    subscriptions: HashMap<String, mpsc::Sender<SubscriptionEvent>>,
}

/// Scriptable wire client. Responses are served from queues loaded by the
/// test; unscripted queries return an empty sync page and unscripted
/// mutations succeed. Subscription streams stay open until the test emits
/// events or drops the client.
#[derive(Clone, Default)]
pub struct MockWireClient {
    inner: Arc<Mutex<MockInner>>,
}

impl MockWireClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_query_response(&self, response: Result<GraphQLResponse>) {
        self.inner.lock().unwrap().query_responses.push_back(response);
    }

    pub fn push_mutate_response(&self, response: Result<GraphQLResponse>) {
        self.inner.lock().unwrap().mutate_responses.push_back(response);
    }

    /// Requests recorded by `query`, in call order.
    pub fn queries(&self) -> Vec<GraphQLRequest> {
        self.inner.lock().unwrap().queries.clone()
    }

    /// Requests recorded by `mutate`, in call order.
    pub fn mutations(&self) -> Vec<GraphQLRequest> {
        self.inner.lock().unwrap().mutations.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }

    /// Requests recorded by `subscribe`, in call order.
    pub fn subscription_requests(&self) -> Vec<GraphQLRequest> {
        self.inner.lock().unwrap().subscription_requests.clone()
    }

    /// Emits an event on the subscription for `model_name`. Returns false if
    /// no such subscription exists or its receiver is gone.
    pub async fn emit(&self, model_name: &str, event: SubscriptionEvent) -> bool {
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner.subscriptions.get(model_name).cloned()
        };
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Reports the subscription for `model_name` as connected.
    pub async fn connect(&self, model_name: &str) -> bool {
        self.emit(
            model_name,
            SubscriptionEvent::Connection(SubscriptionConnectionState::Connected),
        )
        .await
    }
}

#[async_trait]
impl WireClient for MockWireClient {
    async fn query(&self, request: GraphQLRequest) -> Result<GraphQLResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner.queries.push(request);
        inner
            .query_responses
            .pop_front()
            .unwrap_or_else(|| Ok(SyncPage::empty().into_response()))
    }

    async fn mutate(&self, request: GraphQLRequest) -> Result<GraphQLResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner.mutations.push(request);
        inner
            .mutate_responses
            .pop_front()
            .unwrap_or_else(|| Ok(GraphQLResponse::from_data(serde_json::Value::Null)))
    }

    async fn subscribe(&self, model_name: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscription_requests
            .push(GraphQLRequest::subscription(model_name));
        inner.subscriptions.insert(model_name.to_string(), tx);
        Ok(Subscription::new(model_name, rx, None))
    }
}
