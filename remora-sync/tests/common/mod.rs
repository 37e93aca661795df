//! Shared fixtures for the sync engine integration tests

use std::time::Duration;

use tokio::sync::mpsc;

use remora_proto::{MutationEvent, MutationSync, MutationType, Record, SyncMetadata};
use remora_sync::EngineEvent;

pub fn record(id: &str, model: &str, title: &str) -> Record {
    Record::new(id, model, serde_json::json!({ "title": title }))
}

pub fn metadata(id: &str, model: &str, version: u64, deleted: bool) -> SyncMetadata {
    SyncMetadata {
        id: id.to_string(),
        model_name: model.to_string(),
        version,
        last_changed_at: 1_700_000_000,
        deleted,
    }
}

pub fn sync_event(id: &str, model: &str, title: &str, version: u64, deleted: bool) -> MutationSync {
    MutationSync::new(record(id, model, title), metadata(id, model, version, deleted))
}

pub fn local_update(id: &str, model: &str, title: &str, version: u64) -> MutationEvent {
    MutationEvent::new(
        id,
        model,
        MutationType::Update,
        &serde_json::json!({ "title": title }),
        Some(version),
    )
    .unwrap()
}

/// Polls `check` until it holds or two seconds elapse.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within two seconds");
}

/// Drains the observer stream until `label` arrives (inclusive) or the
/// stream closes, returning every label seen.
pub async fn labels_until(rx: &mut mpsc::Receiver<EngineEvent>, label: &str) -> Vec<String> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("observer stream stalled");
        match event {
            Some(event) => {
                seen.push(event.label().to_string());
                if event.label() == label {
                    return seen;
                }
            }
            None => return seen,
        }
    }
}
