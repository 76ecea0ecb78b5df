//! Event ingestion and aggregation service.
//!
//! Events are submitted through a bounded queue, applied to a storage
//! backend by a single background consumer, and summarised on demand.

pub mod aggregate;
pub mod aggregator;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod queue;
pub mod storage;

pub use aggregator::Aggregator;
pub use error::AggregatorError;
pub use models::{AggregatedData, Event, EventFilter};
pub use queue::QueueConfig;
