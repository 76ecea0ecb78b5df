use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{EventStorage, Result};
use crate::aggregate::aggregate;
use crate::models::{AggregatedData, Event, EventFilter};

/// Append-only event log behind a single reader/writer lock.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    events: RwLock<Vec<Event>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Poisoning is ignored: a panicked push leaves the Vec intact.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Event>> {
        self.events.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Event>> {
        self.events.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventStorage for InMemoryStorage {
    async fn add_event(&self, event: Event) -> Result<()> {
        self.write().push(event);
        Ok(())
    }

    async fn get_aggregated(&self, filter: &EventFilter) -> Result<Option<AggregatedData>> {
        let events = self.read();
        Ok(aggregate(
            events.iter().filter(|e| filter.matches(e)),
            filter.user_label(),
            filter.type_label(),
        ))
    }

    async fn get_all_aggregated(&self) -> Result<Vec<AggregatedData>> {
        let events = self.read();

        let mut groups: HashMap<(&str, &str), Vec<&Event>> = HashMap::new();
        for event in events.iter() {
            groups
                .entry((event.user_id.as_str(), event.event_type.as_str()))
                .or_default()
                .push(event);
        }

        Ok(groups
            .into_iter()
            .filter_map(|((user_id, event_type), group)| {
                aggregate(group.into_iter(), user_id, event_type)
            })
            .collect())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
