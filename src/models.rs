use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single numeric observation for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        user_id: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            user_id: user_id.into(),
            value,
            timestamp,
        }
    }
}

/// Summary over a group of events, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedData {
    pub user_id: String,
    pub event_type: String,
    pub count: u64,
    pub total_value: f64,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Query constraints. `None` on any field means "no constraint"; time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Empty strings are treated as unconstrained.
    pub fn new(user_id: &str, event_type: &str) -> Self {
        Self {
            user_id: non_empty(user_id),
            event_type: non_empty(event_type),
            from: None,
            to: None,
        }
    }

    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_range(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn matches_key(&self, event: &Event) -> bool {
        self.user_id.as_deref().map_or(true, |u| event.user_id == u)
            && self
                .event_type
                .as_deref()
                .map_or(true, |t| event.event_type == t)
    }

    pub fn matches_time(&self, event: &Event) -> bool {
        self.from.map_or(true, |from| event.timestamp >= from)
            && self.to.map_or(true, |to| event.timestamp <= to)
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.matches_key(event) && self.matches_time(event)
    }

    /// The user id reported on an aggregate produced for this filter.
    pub fn user_label(&self) -> &str {
        self.user_id.as_deref().unwrap_or("")
    }

    /// The event type reported on an aggregate produced for this filter.
    pub fn type_label(&self) -> &str {
        self.event_type.as_deref().unwrap_or("")
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    #[test]
    fn empty_strings_are_unconstrained() {
        let filter = EventFilter::new("", "");
        assert_eq!(filter, EventFilter::default());
        assert!(filter.matches(&Event::new("1", "click", "user-1", 1.0, at(0))));
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let filter = EventFilter::new("user-1", "click").from(at(1)).to(at(2));
        assert!(!filter.matches(&Event::new("a", "click", "user-1", 1.0, at(0))));
        assert!(filter.matches(&Event::new("b", "click", "user-1", 1.0, at(1))));
        assert!(filter.matches(&Event::new("c", "click", "user-1", 1.0, at(2))));
        assert!(!filter.matches(&Event::new("d", "click", "user-1", 1.0, at(3))));
    }

    #[test]
    fn key_match_is_exact() {
        let filter = EventFilter::new("user-1", "");
        assert!(filter.matches_key(&Event::new("a", "view", "user-1", 1.0, at(0))));
        assert!(!filter.matches_key(&Event::new("b", "view", "user-10", 1.0, at(0))));
    }

    #[test]
    fn event_json_layout() {
        let event = Event::new("e-1", "click", "user-1", 2.5, at(0));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "click");
        assert_eq!(json["user_id"], "user-1");
        assert_eq!(json["timestamp"], "2024-01-01T12:00:00Z");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
