//! Record and mutation types exchanged with the backend

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An application record. The payload is opaque to the sync engine; only the
/// id and model name are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Stable string identifier, unique within the model
    pub id: String,
    /// Model type tag
    pub model_name: String,
    /// Serialized application payload
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        model_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            payload,
        }
    }
}

/// Server-side version metadata for a record. One row per record id,
/// independent of whether a record row exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub id: String,
    pub model_name: String,
    /// Server version counter, monotonically non-decreasing per id
    pub version: u64,
    /// Unix seconds of the last server-side change
    pub last_changed_at: i64,
    /// Tombstone flag
    pub deleted: bool,
}

/// Record plus version metadata, the unit exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationSync {
    pub record: Record,
    pub metadata: SyncMetadata,
}

impl MutationSync {
    pub fn new(record: Record, metadata: SyncMetadata) -> Self {
        Self { record, metadata }
    }
}

/// Kind of change carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single change to one record, either queued locally for upload or derived
/// from a reconciled remote event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    /// Event identifier, unique across the queue
    pub id: String,
    /// Identifier of the record the mutation targets
    pub model_id: String,
    pub model_name: String,
    pub mutation_type: MutationType,
    /// Serialized record payload
    pub json: String,
    /// Unix seconds at creation, used for FIFO ordering
    pub created_at: i64,
    /// Set while the outbound dispatcher holds this event in flight
    pub in_process: bool,
    /// Expected server version for conditional writes, if known
    pub version: Option<u64>,
}

impl MutationEvent {
    /// Creates a locally originated mutation ready for the outbound queue.
    pub fn new(
        model_id: impl Into<String>,
        model_name: impl Into<String>,
        mutation_type: MutationType,
        payload: &serde_json::Value,
        version: Option<u64>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            model_name: model_name.into(),
            mutation_type,
            json: serde_json::to_string(payload)?,
            created_at: Utc::now().timestamp(),
            in_process: false,
            version,
        })
    }

    /// Derives the change event for a reconciled remote mutation. The type
    /// follows the metadata: tombstones are deletes, version one is a create,
    /// anything later is an update.
    pub fn from_remote(sync: &MutationSync) -> Result<Self, serde_json::Error> {
        let mutation_type = if sync.metadata.deleted {
            MutationType::Delete
        } else if sync.metadata.version == 1 {
            MutationType::Create
        } else {
            MutationType::Update
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            model_id: sync.record.id.clone(),
            model_name: sync.record.model_name.clone(),
            mutation_type,
            json: serde_json::to_string(&sync.record.payload)?,
            created_at: sync.metadata.last_changed_at,
            in_process: false,
            version: Some(sync.metadata.version),
        })
    }

    /// Parses the serialized payload back into a JSON value.
    pub fn decode(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.json)
    }
}
