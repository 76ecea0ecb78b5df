//! Event storage backends.
//!
//! Both backends own the raw event set and compute aggregates on read. They
//! must return identical summaries for the same events and filter.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{AggregatedData, Event, EventFilter};

pub mod list_store;
pub mod memory;
pub mod remote;

pub use list_store::{ListStore, MemoryListStore, RedisListStore};
pub use memory::InMemoryStorage;
pub use remote::RemoteStorage;

/// Rolling expiry applied to each remote key on every write.
pub const EVENT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait EventStorage: Send + Sync {
    async fn add_event(&self, event: Event) -> Result<()>;

    /// Aggregate over every stored event matching `filter`; `None` if nothing matches.
    async fn get_aggregated(&self, filter: &EventFilter) -> Result<Option<AggregatedData>>;

    /// One summary per `(user_id, event_type)` group, in no particular order.
    async fn get_all_aggregated(&self) -> Result<Vec<AggregatedData>>;

    fn backend_type(&self) -> &'static str;
}
