use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{AggregatedData, Event, EventFilter};
use crate::queue::{IngestionQueue, QueueConfig};
use crate::storage::EventStorage;

/// Ingestion queue in front of a storage backend.
///
/// Performs no validation; callers are expected to have filled in `id`,
/// `timestamp` and checked the required fields before `submit`.
pub struct Aggregator {
    storage: Arc<dyn EventStorage>,
    queue: IngestionQueue,
    token: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    pub fn new(storage: Arc<dyn EventStorage>, config: QueueConfig) -> Self {
        Self {
            storage,
            queue: IngestionQueue::new(config),
            token: CancellationToken::new(),
            consumer: Mutex::new(None),
        }
    }

    /// Spawns the background consumer. Calling it again is a no-op.
    pub fn start(&self) {
        if let Some(handle) = self.queue.start(self.storage.clone(), self.token.child_token()) {
            *self.consumer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
    }

    pub async fn submit(&self, event: Event) -> Result<()> {
        self.queue.submit(event).await
    }

    pub async fn query(&self, filter: &EventFilter) -> Result<Option<AggregatedData>> {
        Ok(self.storage.get_aggregated(filter).await?)
    }

    pub async fn query_all(&self) -> Result<Vec<AggregatedData>> {
        Ok(self.storage.get_all_aggregated().await?)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn backend_type(&self) -> &'static str {
        self.storage.backend_type()
    }

    /// Stops the consumer and waits for it to exit. Events still queued are dropped.
    pub async fn shutdown(&self) {
        info!(pending = self.queue.depth(), "Aggregator stopping...");
        self.token.cancel();
        self.queue.close();

        let handle = self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event consumer task failed");
            }
        }
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
