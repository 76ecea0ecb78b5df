//! Bounded ingestion queue with a single background consumer.
//!
//! Submission waits at most `enqueue_timeout` for space. The consumer drains
//! strictly in FIFO order, one event at a time, until its cancellation token
//! fires; whatever is still queued at that point is dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AggregatorError, Result};
use crate::models::Event;
use crate::storage::EventStorage;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub enqueue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

pub struct IngestionQueue {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    capacity: usize,
    enqueue_timeout: Duration,
}

impl IngestionQueue {
    pub fn new(config: QueueConfig) -> Self {
        // tokio channels cannot be zero-sized.
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            enqueue_timeout: config.enqueue_timeout,
        }
    }

    pub async fn submit(&self, event: Event) -> Result<()> {
        let event = match self.tx.try_send(event) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(AggregatorError::QueueClosed),
            Err(TrySendError::Full(event)) => event,
        };

        if self.enqueue_timeout.is_zero() {
            return Err(AggregatorError::QueueTimeout(self.enqueue_timeout));
        }

        self.tx
            .send_timeout(event, self.enqueue_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => AggregatorError::QueueTimeout(self.enqueue_timeout),
                SendTimeoutError::Closed(_) => AggregatorError::QueueClosed,
            })
    }

    /// Number of events currently buffered.
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spawns the consumer task. Returns `None` if it was already spawned or
    /// the queue has been closed.
    pub fn start(
        &self,
        storage: Arc<dyn EventStorage>,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let rx = self.take_receiver()?;
        Some(tokio::spawn(consume(rx, storage, token)))
    }

    /// Drops the receiver if no consumer ever took it, so later submits fail fast.
    pub fn close(&self) {
        drop(self.take_receiver());
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Event>,
    storage: Arc<dyn EventStorage>,
    token: CancellationToken,
) {
    info!(backend = storage.backend_type(), "Event consumer started");
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => {
                let Some(event) = next else { break };
                process_event(storage.as_ref(), event).await;
            }
        }
    }
    if !rx.is_empty() {
        debug!(dropped = rx.len(), "Dropping undelivered events on shutdown");
    }
    info!("Event consumer stopped");
}

async fn process_event(storage: &dyn EventStorage, event: Event) {
    let (id, user_id, event_type, value) = (
        event.id.clone(),
        event.user_id.clone(),
        event.event_type.clone(),
        event.value,
    );
    match storage.add_event(event).await {
        Ok(()) => debug!(
            id = %id,
            user = %user_id,
            event_type = %event_type,
            value,
            "Processed event"
        ),
        Err(e) => warn!(id = %id, error = %e, "Failed to store event, dropping it"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(id: &str) -> Event {
        Event::new(id, "click", "user-1", 1.0, Utc::now())
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let queue = IngestionQueue::new(QueueConfig {
            capacity: 0,
            enqueue_timeout: Duration::ZERO,
        });
        assert_eq!(queue.capacity(), 1);
        queue.submit(event("a")).await.unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn full_queue_times_out_after_wait() {
        let queue = IngestionQueue::new(QueueConfig {
            capacity: 1,
            enqueue_timeout: Duration::from_millis(20),
        });
        queue.submit(event("a")).await.unwrap();

        let started = std::time::Instant::now();
        let err = queue.submit(event("b")).await.unwrap_err();
        assert!(matches!(err, AggregatorError::QueueTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn closed_queue_rejects_submissions() {
        let queue = IngestionQueue::new(QueueConfig::default());
        queue.close();
        assert!(matches!(
            queue.submit(event("a")).await,
            Err(AggregatorError::QueueClosed)
        ));
    }
}
