use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced by the aggregator service to the request layer.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The ingestion queue stayed full for the whole wait window; the event was rejected.
    #[error("ingestion queue full{}, event rejected", waited(.0))]
    QueueTimeout(Duration),

    /// The background consumer has shut down.
    #[error("ingestion queue closed")]
    QueueClosed,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;

fn waited(wait: &Duration) -> String {
    if wait.is_zero() {
        String::new()
    } else {
        format!(" for {:?}", wait)
    }
}
