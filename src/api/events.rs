//! Event ingest, history and live stream endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use super::{decode, ApiResult, AppState};
use crate::core::{EventFilter, EventQuery};
use crate::domain::{Event, NewEvent};

/// `POST /events`: 201 for a new event, 200 when an idempotency key matched
pub async fn create_event(
    State(hub): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let new: NewEvent = decode(body)?;
    let appended = hub.ingest.append(new)?;
    let status = if appended.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(appended.event)))
}

/// `GET /events`
pub async fn list_events(
    State(hub): State<AppState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    Ok(Json(hub.store.query(&query)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Type glob, e.g. `dojo.*`
    #[serde(rename = "type")]
    pub type_glob: Option<String>,
    pub source: Option<String>,
}

/// `GET /events/stream`: server-sent events for newly appended events
pub async fn stream_events(
    State(hub): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let filter = EventFilter::new(query.type_glob.as_deref(), query.source.as_deref())?;
    let subscription = hub.dispatcher.subscribe(filter);
    debug!(subscriber = subscription.id(), "SSE subscriber connected");

    let stream = subscription.map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn to_sse(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.event_type.clone())
        .data(data)
}
