//! In-memory storage adapter for tests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use remora_proto::{MutationEvent, Record, SyncMetadata};

use crate::adapter::StorageAdapter;
use crate::errors::Result;

#[derive(Default)]
struct MemoryInner {
    records: HashMap<(String, String), Record>,
    metadata: HashMap<String, SyncMetadata>,
    queue: Vec<MutationEvent>,
    journal: Vec<String>,
}

/// HashMap-backed adapter. Keeps a write journal so tests can assert on the
/// exact order of store operations.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write performed so far, in order, as `op:model/id` entries.
    pub async fn journal(&self) -> Vec<String> {
        self.inner.read().await.journal.clone()
    }

    pub async fn record_count(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.read().await.queue.len()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn save_record(&self, record: &Record) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .journal
            .push(format!("save_record:{}/{}", record.model_name, record.id));
        inner
            .records
            .insert((record.model_name.clone(), record.id.clone()), record.clone());
        Ok(())
    }

    async fn get_record(&self, model_name: &str, id: &str) -> Result<Option<Record>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .get(&(model_name.to_string(), id.to_string()))
            .cloned())
    }

    async fn delete_record(&self, model_name: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .journal
            .push(format!("delete_record:{}/{}", model_name, id));
        inner.records.remove(&(model_name.to_string(), id.to_string()));
        Ok(())
    }

    async fn query_records(&self, model_name: &str) -> Result<Vec<Record>> {
        let inner = self.inner.read().await;
        let mut records: Vec<Record> = inner
            .records
            .values()
            .filter(|record| record.model_name == model_name)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn save_metadata(&self, metadata: &SyncMetadata) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .journal
            .push(format!("save_metadata:{}/{}", metadata.model_name, metadata.id));
        inner.metadata.insert(metadata.id.clone(), metadata.clone());
        Ok(())
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<SyncMetadata>> {
        Ok(self.inner.read().await.metadata.get(id).cloned())
    }

    async fn enqueue_mutation(&self, event: &MutationEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .journal
            .push(format!("enqueue_mutation:{}/{}", event.model_name, event.model_id));
        // Replacement keeps the original queue position
        if let Some(existing) = inner.queue.iter_mut().find(|queued| queued.id == event.id) {
            *existing = event.clone();
        } else {
            inner.queue.push(event.clone());
        }
        Ok(())
    }

    async fn head_mutation(&self) -> Result<Option<MutationEvent>> {
        let inner = self.inner.read().await;
        let mut head: Option<&MutationEvent> = None;
        for event in &inner.queue {
            if head.map_or(true, |current| event.created_at < current.created_at) {
                head = Some(event);
            }
        }
        Ok(head.cloned())
    }

    async fn pending_mutation(&self, model_id: &str) -> Result<Option<MutationEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .queue
            .iter()
            .rev()
            .find(|event| event.model_id == model_id)
            .cloned())
    }

    async fn mark_in_process(&self, id: &str, in_process: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(event) = inner.queue.iter_mut().find(|event| event.id == id) {
            event.in_process = in_process;
        }
        Ok(())
    }

    async fn delete_mutation(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.queue.retain(|event| event.id != id);
        Ok(())
    }

    async fn clear_in_process(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        for event in &mut inner.queue {
            event.in_process = false;
        }
        Ok(())
    }
}
