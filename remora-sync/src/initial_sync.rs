//! Initial hydration from the backend
//!
//! Pages the base sync query per model and feeds every item through the same
//! reconcile funnel as subscription events. No cursor survives this layer; a
//! fresh run hydrates from the beginning.

use std::sync::Arc;

use tracing::{debug, info};

use remora_proto::{GraphQLRequest, SyncPage, WireClient};

use crate::errors::{Result, SyncError};
use crate::incoming::IncomingInjector;

pub struct InitialSyncOrchestrator {
    model_names: Vec<String>,
    wire: Arc<dyn WireClient>,
    injector: IncomingInjector,
    page_size: u32,
}

impl InitialSyncOrchestrator {
    pub fn new(
        model_names: Vec<String>,
        wire: Arc<dyn WireClient>,
        injector: IncomingInjector,
        page_size: u32,
    ) -> Self {
        Self {
            model_names,
            wire,
            injector,
            page_size,
        }
    }

    /// Hydrates every model to completion. Any wire or storage failure is
    /// terminal for the whole run.
    pub async fn run(self) -> Result<()> {
        for model_name in &self.model_names {
            self.hydrate_model(model_name).await?;
        }
        Ok(())
    }

    async fn hydrate_model(&self, model_name: &str) -> Result<()> {
        let mut next_token: Option<String> = None;
        let mut total = 0usize;

        loop {
            let request = GraphQLRequest::sync(model_name, self.page_size, next_token.clone());
            let response = self.wire.query(request).await?;

            if let Some(error) = response.errors.first() {
                return Err(SyncError::InitialSync(error.message.clone()));
            }
            let data = response
                .data
                .ok_or_else(|| SyncError::InitialSync(format!("empty sync page for {model_name}")))?;
            let page: SyncPage = serde_json::from_value(data)?;

            total += page.items.len();
            for item in &page.items {
                self.injector.inject(item).await?;
            }
            debug!(model = %model_name, items = page.items.len(), "sync page applied");

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        info!(model = %model_name, records = total, "initial sync complete");
        Ok(())
    }
}
