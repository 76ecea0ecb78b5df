use std::convert::Infallible;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{self, Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use crate::aggregator::Aggregator;
use crate::error::AggregatorError;
use crate::models::{Event, EventFilter};

/// Body of `POST /events`; `id` and `timestamp` are filled in when absent.
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventRequest {
    fn into_event(self) -> Result<Event, &'static str> {
        if self.user_id.is_empty() || self.event_type.is_empty() {
            return Err("user_id and type are required");
        }
        Ok(Event {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: self.event_type,
            user_id: self.user_id,
            value: self.value,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AggregatedQuery {
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl AggregatedQuery {
    fn into_filter(self) -> Result<EventFilter, String> {
        let from = parse_time("from", self.from.as_deref())?;
        let to = parse_time("to", self.to.as_deref())?;
        Ok(EventFilter::new(
            self.user_id.as_deref().unwrap_or(""),
            self.event_type.as_deref().unwrap_or(""),
        )
        .with_range(from, to))
    }
}

fn parse_time(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match raw.filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| format!("invalid {} timestamp {:?}: {}", name, s, e)),
    }
}

fn error_reply(message: impl Into<String>, status: StatusCode) -> WithStatus<Json> {
    reply::with_status(reply::json(&json!({ "error": message.into() })), status)
}

fn storage_failure(err: AggregatorError) -> WithStatus<Json> {
    error!(error = %err, "Query failed");
    error_reply(err.to_string(), StatusCode::SERVICE_UNAVAILABLE)
}

async fn handle_post_event(
    body: Bytes,
    aggregator: Arc<Aggregator>,
) -> Result<WithStatus<Json>, Infallible> {
    let request: EventRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return Ok(error_reply("Invalid request body", StatusCode::BAD_REQUEST)),
    };
    let event = match request.into_event() {
        Ok(event) => event,
        Err(msg) => return Ok(error_reply(msg, StatusCode::BAD_REQUEST)),
    };

    let id = event.id.clone();
    match aggregator.submit(event).await {
        Ok(()) => Ok(reply::with_status(
            reply::json(&json!({ "id": id, "status": "accepted" })),
            StatusCode::CREATED,
        )),
        Err(e) => {
            warn!(id = %id, error = %e, "Rejected event");
            Ok(error_reply(e.to_string(), StatusCode::SERVICE_UNAVAILABLE))
        }
    }
}

async fn handle_get_aggregated(
    query: AggregatedQuery,
    aggregator: Arc<Aggregator>,
) -> Result<WithStatus<Json>, Infallible> {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(msg) => return Ok(error_reply(msg, StatusCode::BAD_REQUEST)),
    };

    Ok(match aggregator.query(&filter).await {
        Ok(Some(data)) => reply::with_status(reply::json(&data), StatusCode::OK),
        Ok(None) => reply::with_status(
            reply::json(&json!({ "message": "no data found" })),
            StatusCode::OK,
        ),
        Err(e) => storage_failure(e),
    })
}

async fn handle_get_all(aggregator: Arc<Aggregator>) -> Result<WithStatus<Json>, Infallible> {
    Ok(match aggregator.query_all().await {
        Ok(data) => reply::with_status(reply::json(&data), StatusCode::OK),
        Err(e) => storage_failure(e),
    })
}

async fn handle_health(aggregator: Arc<Aggregator>) -> Result<impl Reply, Infallible> {
    Ok(reply::json(&json!({
        "status": "ok",
        "backend": aggregator.backend_type(),
        "queue_depth": aggregator.queue_depth(),
    })))
}

fn with_aggregator(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (Arc<Aggregator>,), Error = Infallible> + Clone {
    warp::any().map(move || aggregator.clone())
}

pub fn routes(
    aggregator: Arc<Aggregator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let post_event = warp::path!("events")
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_aggregator(aggregator.clone()))
        .and_then(handle_post_event);

    let aggregated = warp::path!("aggregated")
        .and(warp::get())
        .and(warp::query::<AggregatedQuery>())
        .and(with_aggregator(aggregator.clone()))
        .and_then(handle_get_aggregated);

    let aggregated_all = warp::path!("aggregated" / "all")
        .and(warp::get())
        .and(with_aggregator(aggregator.clone()))
        .and_then(handle_get_all);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_aggregator(aggregator))
        .and_then(handle_health);

    post_event
        .or(aggregated)
        .or(aggregated_all)
        .or(health)
        .with(warp::trace::request())
}
