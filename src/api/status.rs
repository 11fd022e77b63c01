//! Pipeline, resume and health endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ApiResult, AppState};
use crate::core::{Clock, PushOutcome, ResumeSnapshot};
use crate::domain::{Pipeline, PipelineDetail, PipelineStats};

pub async fn list_pipelines(State(hub): State<AppState>) -> Json<Vec<Pipeline>> {
    Json(hub.tracker.list())
}

pub async fn pipeline_stats(State(hub): State<AppState>) -> Json<PipelineStats> {
    Json(hub.tracker.stats())
}

pub async fn get_pipeline(
    State(hub): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<PipelineDetail>> {
    Ok(Json(hub.tracker.detail(&job_id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeQuery {
    #[serde(default)]
    pub push: bool,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    #[serde(flatten)]
    pub snapshot: ResumeSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pushes: Option<Vec<PushOutcome>>,
}

/// `GET /resume`, optionally pushing the snapshot to every enabled target
pub async fn resume(
    State(hub): State<AppState>,
    Query(query): Query<ResumeQuery>,
) -> ApiResult<Json<ResumeResponse>> {
    let response = if query.push {
        let (snapshot, outcomes) = hub.resume.push_all().await?;
        ResumeResponse {
            snapshot,
            pushes: Some(outcomes),
        }
    } else {
        ResumeResponse {
            snapshot: hub.resume.build_snapshot().await?,
            pushes: None,
        }
    };
    Ok(Json(response))
}

/// `GET /health`: 503 when either database cannot be reached
pub async fn health(State(hub): State<AppState>) -> (StatusCode, Json<Value>) {
    let storage = hub.store.ping().and_then(|_| hub.catalog.ping());
    let (status, code, storage_error) = match storage {
        Ok(()) => ("ok", StatusCode::OK, None),
        Err(e) => ("degraded", StatusCode::SERVICE_UNAVAILABLE, Some(e.to_string())),
    };
    let latest_event_id = hub.store.latest_id().ok();

    let body = json!({
        "status": status,
        "time": hub.clock.now(),
        "store": {
            "ok": storage_error.is_none(),
            "error": storage_error,
            "latest_event_id": latest_event_id,
        },
        "dispatcher": {
            "subscribers": hub.dispatcher.subscriber_count(),
        },
        "scheduler": hub.scheduler.stats(),
    });
    (code, Json(body))
}
