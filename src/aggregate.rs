use crate::models::{AggregatedData, Event};

/// Summarises `events` in a single pass.
///
/// Returns `None` for an empty input. Extremes are replaced only on a strict
/// comparison, so the first event in iteration order wins ties.
pub fn aggregate<'a, I>(events: I, user_id: &str, event_type: &str) -> Option<AggregatedData>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut iter = events.into_iter();
    let first = iter.next()?;

    let mut agg = AggregatedData {
        user_id: user_id.to_string(),
        event_type: event_type.to_string(),
        count: 1,
        total_value: first.value,
        avg_value: 0.0,
        min_value: first.value,
        max_value: first.value,
        start_time: first.timestamp,
        end_time: first.timestamp,
    };

    for event in iter {
        agg.count += 1;
        agg.total_value += event.value;
        if event.value < agg.min_value {
            agg.min_value = event.value;
        }
        if event.value > agg.max_value {
            agg.max_value = event.value;
        }
        if event.timestamp < agg.start_time {
            agg.start_time = event.timestamp;
        }
        if event.timestamp > agg.end_time {
            agg.end_time = event.timestamp;
        }
    }

    agg.avg_value = agg.total_value / agg.count as f64;
    Some(agg)
}
