//! Key-structured backend: one list per `(user_id, event_type)` under
//! `events:{user_id}:{event_type}`, newest record first, with a rolling
//! 24 hour expiry per key.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{EventStorage, ListStore, Result, EVENT_RETENTION};
use crate::aggregate::aggregate;
use crate::models::{AggregatedData, Event, EventFilter};

const KEY_PREFIX: &str = "events";

pub fn event_key(user_id: &str, event_type: &str) -> String {
    format!("{}:{}:{}", KEY_PREFIX, user_id, event_type)
}

/// Splits a key back into `(user_id, event_type)`. Keys without exactly
/// three `:`-separated segments are rejected.
pub fn parse_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(KEY_PREFIX), Some(user_id), Some(event_type), None) => Some((user_id, event_type)),
        _ => None,
    }
}

/// Escapes Redis glob metacharacters so `segment` only matches itself.
pub fn escape_pattern(segment: &str) -> String {
    let mut escaped = String::with_capacity(segment.len());
    for c in segment.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Where to look for a filter: a single key, or a scan pattern.
#[derive(Debug, PartialEq, Eq)]
enum KeySelector {
    Exact(String),
    Pattern(String),
}

impl KeySelector {
    fn for_filter(filter: &EventFilter) -> Self {
        match (filter.user_id.as_deref(), filter.event_type.as_deref()) {
            (Some(user_id), Some(event_type)) => Self::Exact(event_key(user_id, event_type)),
            (Some(user_id), None) => {
                Self::Pattern(format!("{}:{}:*", KEY_PREFIX, escape_pattern(user_id)))
            }
            (None, Some(event_type)) => {
                Self::Pattern(format!("{}:*:{}", KEY_PREFIX, escape_pattern(event_type)))
            }
            (None, None) => Self::Pattern(format!("{}:*", KEY_PREFIX)),
        }
    }
}

pub struct RemoteStorage<S> {
    store: Arc<S>,
}

impl<S: ListStore> RemoteStorage<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn resolve_keys(&self, filter: &EventFilter) -> Result<Vec<String>> {
        match KeySelector::for_filter(filter) {
            KeySelector::Exact(key) => Ok(vec![key]),
            KeySelector::Pattern(pattern) => self.store.scan_keys(&pattern).await,
        }
    }

    /// Reads and decodes one list. Records that fail to decode are skipped.
    async fn read_events(&self, key: &str, filter: &EventFilter) -> Result<Vec<Event>> {
        let raw = self.store.range_all(key).await?;
        let mut events = Vec::with_capacity(raw.len());
        for record in raw {
            match serde_json::from_str::<Event>(&record) {
                Ok(event) if filter.matches_time(&event) => events.push(event),
                Ok(_) => {}
                Err(e) => warn!(key, error = %e, "Skipping undecodable event record"),
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl<S: ListStore + 'static> EventStorage for RemoteStorage<S> {
    async fn add_event(&self, event: Event) -> Result<()> {
        let key = event_key(&event.user_id, &event.event_type);
        let record = serde_json::to_string(&event)?;
        self.store.push_front(&key, record).await?;
        self.store.expire(&key, EVENT_RETENTION).await?;
        debug!(key = %key, id = %event.id, "Stored event");
        Ok(())
    }

    async fn get_aggregated(&self, filter: &EventFilter) -> Result<Option<AggregatedData>> {
        let keys = self.resolve_keys(filter).await?;

        let mut events = Vec::new();
        for key in &keys {
            events.extend(self.read_events(key, filter).await?);
        }

        // Glob patterns can over-match when ids themselves contain ':'.
        Ok(aggregate(
            events.iter().filter(|e| filter.matches_key(e)),
            filter.user_label(),
            filter.type_label(),
        ))
    }

    async fn get_all_aggregated(&self) -> Result<Vec<AggregatedData>> {
        let keys = self.store.scan_keys(&format!("{}:*", KEY_PREFIX)).await?;
        let unbounded = EventFilter::default();

        let mut result = Vec::with_capacity(keys.len());
        for key in &keys {
            let Some((user_id, event_type)) = parse_key(key) else {
                debug!(key = %key, "Skipping malformed key");
                continue;
            };
            let events = self.read_events(key, &unbounded).await?;
            if let Some(agg) = aggregate(&events, user_id, event_type) {
                result.push(agg);
            }
        }
        Ok(result)
    }

    fn backend_type(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryListStore;
    use chrono::Utc;

    #[test]
    fn key_round_trip() {
        assert_eq!(event_key("user-1", "click"), "events:user-1:click");
        assert_eq!(parse_key("events:user-1:click"), Some(("user-1", "click")));
        assert_eq!(parse_key("events:a:b:c"), None);
        assert_eq!(parse_key("events:only"), None);
        assert_eq!(parse_key("other:a:b"), None);
    }

    #[test]
    fn pattern_segments_are_escaped() {
        assert_eq!(escape_pattern("plain-id"), "plain-id");
        assert_eq!(escape_pattern("u[1]"), r"u\[1\]");
        assert_eq!(escape_pattern(r"a*b?c\d"), r"a\*b\?c\\d");
        assert_eq!(
            KeySelector::for_filter(&EventFilter::new("u[1]", "")),
            KeySelector::Pattern(r"events:u\[1\]:*".into())
        );
        assert_eq!(
            KeySelector::for_filter(&EventFilter::new("", "a*")),
            KeySelector::Pattern(r"events:*:a\*".into())
        );
    }

    #[test]
    fn selector_per_filter_shape() {
        assert_eq!(
            KeySelector::for_filter(&EventFilter::new("u", "click")),
            KeySelector::Exact("events:u:click".into())
        );
        assert_eq!(
            KeySelector::for_filter(&EventFilter::new("u", "")),
            KeySelector::Pattern("events:u:*".into())
        );
        assert_eq!(
            KeySelector::for_filter(&EventFilter::new("", "click")),
            KeySelector::Pattern("events:*:click".into())
        );
        assert_eq!(
            KeySelector::for_filter(&EventFilter::default()),
            KeySelector::Pattern("events:*".into())
        );
    }

    #[tokio::test]
    async fn writes_prepend_and_refresh_expiry() {
        let store = Arc::new(MemoryListStore::new());
        let storage = RemoteStorage::new(store.clone());
        let now = Utc::now();

        storage.add_event(Event::new("1", "click", "u", 1.0, now)).await.unwrap();
        storage.add_event(Event::new("2", "click", "u", 2.0, now)).await.unwrap();

        let records = store.range_all("events:u:click").await.unwrap();
        let ids: Vec<String> = records
            .iter()
            .map(|r| serde_json::from_str::<Event>(r).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["2", "1"]);

        let ttl = store.ttl("events:u:click").unwrap();
        assert!(ttl > EVENT_RETENTION - std::time::Duration::from_secs(60));
        assert!(ttl <= EVENT_RETENTION);
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped() {
        let store = Arc::new(MemoryListStore::new());
        let storage = RemoteStorage::new(store.clone());

        storage
            .add_event(Event::new("1", "click", "u", 10.0, Utc::now()))
            .await
            .unwrap();
        store.push_front("events:u:click", "{not json".into()).await.unwrap();

        let agg = storage
            .get_aggregated(&EventFilter::new("u", "click"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agg.count, 1);
        assert_eq!(agg.total_value, 10.0);
    }

    #[tokio::test]
    async fn malformed_keys_are_dropped_from_group_listing() {
        let store = Arc::new(MemoryListStore::new());
        let storage = RemoteStorage::new(store.clone());
        let event = Event::new("1", "click", "u", 1.0, Utc::now());

        storage.add_event(event.clone()).await.unwrap();
        store
            .push_front("events:a:b:c", serde_json::to_string(&event).unwrap())
            .await
            .unwrap();

        let all = storage.get_all_aggregated().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, "u");
    }

    #[tokio::test]
    async fn post_filter_drops_pattern_over_match() {
        let store = Arc::new(MemoryListStore::new());
        let storage = RemoteStorage::new(store.clone());
        let now = Utc::now();

        // "events:*:click" also matches the key of user "a:b" with type "click".
        storage.add_event(Event::new("1", "click", "a:b", 1.0, now)).await.unwrap();
        storage.add_event(Event::new("2", "click", "c", 2.0, now)).await.unwrap();

        let agg = storage
            .get_aggregated(&EventFilter::new("a", ""))
            .await
            .unwrap();
        assert!(agg.is_none());

        let agg = storage
            .get_aggregated(&EventFilter::new("", "click"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agg.count, 2);
    }
}
