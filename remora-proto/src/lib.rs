//! Wire types and transport contract for the remora sync engine
//!
//! This crate defines what travels between a local store and a GraphQL-style
//! backend: records with server version metadata, the request and response
//! envelopes, and the `WireClient` trait the engine consumes. A scriptable
//! `MockWireClient` ships here so every crate in the workspace can test
//! against the same transport surface.

pub mod client;
pub mod errors;
pub mod model;
pub mod request;

pub use client::{
    MockWireClient, Subscription, SubscriptionConnectionState, SubscriptionEvent, WireClient,
};
pub use errors::{ProtoError, Result};
pub use model::{MutationEvent, MutationSync, MutationType, Record, SyncMetadata};
pub use request::{
    GraphQLError, GraphQLRequest, GraphQLResponse, SyncPage, ERROR_TYPE_CONDITIONAL_CHECK,
    ERROR_TYPE_CONFLICT_UNHANDLED,
};
