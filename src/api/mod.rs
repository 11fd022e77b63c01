//! HTTP API.
//!
//! JSON over axum. Errors are returned as `{"error": kind, "message": text}`
//! with a status code derived from the `HubError` variant.

mod admin;
mod events;
mod status;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::error;

use crate::core::Hub;
use crate::error::HubError;

pub type AppState = Arc<Hub>;

/// Build the router over a shared hub
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/events", get(events::list_events).post(events::create_event))
        .route("/events/stream", get(events::stream_events))
        .route("/rules", get(admin::list_rules).post(admin::create_rule))
        .route(
            "/rules/:id",
            get(admin::get_rule)
                .patch(admin::update_rule)
                .delete(admin::delete_rule),
        )
        .route("/rules/:id/log", get(admin::rule_log))
        .route(
            "/schedules",
            get(admin::list_schedules).post(admin::create_schedule),
        )
        .route(
            "/schedules/:id",
            get(admin::get_schedule)
                .patch(admin::update_schedule)
                .delete(admin::delete_schedule),
        )
        .route(
            "/push-targets",
            get(admin::list_push_targets).post(admin::create_push_target),
        )
        .route(
            "/push-targets/:id",
            get(admin::get_push_target)
                .patch(admin::update_push_target)
                .delete(admin::delete_push_target),
        )
        .route("/pipelines", get(status::list_pipelines))
        .route("/pipelines/stats", get(status::pipeline_stats))
        .route("/pipelines/:job_id", get(status::get_pipeline))
        .route("/resume", get(status::resume))
        .route("/health", get(status::health))
        .with_state(hub)
}

/// `HubError` as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            HubError::Validation(_) | HubError::Configuration(_) | HubError::Evaluation(_) => {
                StatusCode::BAD_REQUEST
            }
            HubError::NotFound { .. } => StatusCode::NOT_FOUND,
            HubError::Conflict { .. } => StatusCode::CONFLICT,
            HubError::ActionExecution(_) => StatusCode::BAD_GATEWAY,
            HubError::Storage(_) | HubError::Io(_) | HubError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Decode a request body, reporting shape errors as validation failures
pub(crate) fn decode<T: DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body).map_err(|e| ApiError(HubError::validation(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::webhook::RecordingWebhookSender;
    use crate::core::HubOptions;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Hub>) {
        let options = HubOptions::default().with_webhook(Arc::new(RecordingWebhookSender::new()));
        let hub = Arc::new(Hub::in_memory(options).unwrap());
        (router(hub.clone()), hub)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_post_and_query_events() {
        let (app, _) = app();
        let (status, created) = send(
            &app,
            "POST",
            "/events",
            Some(json!({"type": "dojo.job_failed", "source": "dojo", "payload": {"job_id": "j1"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["id"], 1);
        assert_eq!(created["type"], "dojo.job_failed");

        send(&app, "POST", "/events", Some(json!({"type": "deploy.done", "source": "deploy"}))).await;

        let (status, listed) = send(&app, "GET", "/events?type_prefix=dojo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (_, all) = send(&app, "GET", "/events?limit=10", None).await;
        assert_eq!(all[0]["type"], "deploy.done");
    }

    #[tokio::test]
    async fn test_invalid_event_is_400() {
        let (app, hub) = app();
        let (status, body) = send(&app, "POST", "/events", Some(json!({"source": "dojo"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let (status, _) = send(
            &app,
            "POST",
            "/events",
            Some(json!({"type": "a.b", "source": "s", "payload": [1, 2]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(hub.store.latest_id().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idempotent_post_returns_200() {
        let (app, _) = app();
        let body = json!({"type": "deploy.done", "source": "ci", "idempotency_key": "run-9"});
        let (first, a) = send(&app, "POST", "/events", Some(body.clone())).await;
        let (second, b) = send(&app, "POST", "/events", Some(body)).await;
        assert_eq!(first, StatusCode::CREATED);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(a["id"], b["id"]);
    }

    #[tokio::test]
    async fn test_rule_lifecycle() {
        let (app, _) = app();
        let (status, rule) = send(
            &app,
            "POST",
            "/rules",
            Some(json!({
                "name": "dojo failures",
                "event_type_pattern": "dojo.*",
                "condition": {"payload.retry_count": {"$gt": 2}},
                "action": {"type": "emit", "event_type": "alert.dojo_failure"},
                "cooldown_seconds": 60
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = rule["id"].as_str().unwrap().to_string();

        let (status, patched) = send(
            &app,
            "PATCH",
            &format!("/rules/{}", id),
            Some(json!({"enabled": false, "version": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["version"], 2);

        let (status, body) = send(
            &app,
            "PATCH",
            &format!("/rules/{}", id),
            Some(json!({"enabled": true, "version": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");

        let (status, log) = send(&app, "GET", &format!("/rules/{}/log", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(log.as_array().unwrap().is_empty());

        let (status, _) = send(&app, "DELETE", &format!("/rules/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &format!("/rules/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_rule_rejected() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/rules",
            Some(json!({
                "name": "bad",
                "event_type_pattern": "dojo.*",
                "condition": {"payload.x": {"$between": [1, 2]}},
                "action": {"type": "log"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "configuration_error");
    }

    #[tokio::test]
    async fn test_schedules_and_push_targets() {
        let (app, _) = app();
        let (status, _) = send(
            &app,
            "POST",
            "/schedules",
            Some(json!({
                "name": "morning",
                "cron_expression": "0 9 * * *",
                "event_type": "schedule.morning",
                "source": "scheduler"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(
            &app,
            "POST",
            "/schedules",
            Some(json!({
                "name": "broken",
                "cron_expression": "every day",
                "event_type": "schedule.x",
                "source": "scheduler"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, target) = send(
            &app,
            "POST",
            "/push-targets",
            Some(json!({"type": "webhook", "destination": "https://example.com/resume"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(target["type"], "webhook");
        let (_, targets) = send(&app, "GET", "/push-targets", None).await;
        assert_eq!(targets.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pipelines_and_health() {
        let (app, hub) = app();
        let event = hub
            .ingest
            .append(crate::domain::NewEvent::new(
                "pipeline.stage",
                "dojo",
                json!({"job_id": "j1", "stage": "tts"}),
            ))
            .unwrap()
            .event;
        hub.tracker.observe(&event).unwrap();

        let (status, detail) = send(&app, "GET", "/pipelines/j1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["stage"], "tts");
        assert_eq!(detail["transitions"].as_array().unwrap().len(), 1);

        let (_, stats) = send(&app, "GET", "/pipelines/stats", None).await;
        assert_eq!(stats["total"], 1);

        let (status, _) = send(&app, "GET", "/pipelines/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");
        assert_eq!(health["dispatcher"]["subscribers"], 0);

        let (status, snapshot) = send(&app, "GET", "/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["pipelines"][0]["job_id"], "j1");
    }
}
