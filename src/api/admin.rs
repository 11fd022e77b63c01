//! Administrative CRUD for rules, schedules and push targets.
//!
//! Updates carry an optional `version`; a stale one is answered with 409.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{decode, ApiResult, AppState};
use crate::core::Clock;
use crate::domain::{
    PushTarget, PushTargetPatch, PushTargetSpec, Rule, RuleExecutionRecord, RulePatch, RuleSpec,
    Schedule, SchedulePatch, ScheduleSpec,
};

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 1000;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// Rules

pub async fn list_rules(State(hub): State<AppState>) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(hub.catalog.list_rules()?))
}

pub async fn create_rule(
    State(hub): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Rule>)> {
    let spec: RuleSpec = decode(body)?;
    let rule = spec.into_rule(new_id(), hub.clock.now())?;
    hub.catalog.insert_rule(&rule)?;
    tracing::info!(rule_id = %rule.id, rule = %rule.name, "Rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(
    State(hub): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(hub.catalog.get_rule(&id)?))
}

pub async fn update_rule(
    State(hub): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Rule>> {
    let patch: RulePatch = decode(body)?;
    Ok(Json(hub.catalog.update_rule(&id, patch, hub.clock.now())?))
}

pub async fn delete_rule(
    State(hub): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    hub.catalog.delete_rule(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

/// `GET /rules/{id}/log`: execution records, newest first
pub async fn rule_log(
    State(hub): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<RuleExecutionRecord>>> {
    // 404 for unknown rules rather than an empty log
    hub.catalog.get_rule(&id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    Ok(Json(hub.catalog.list_executions(&id, limit)?))
}

// Schedules

pub async fn list_schedules(State(hub): State<AppState>) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(hub.catalog.list_schedules()?))
}

pub async fn create_schedule(
    State(hub): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let spec: ScheduleSpec = decode(body)?;
    let schedule = spec.into_schedule(new_id(), hub.clock.now())?;
    hub.catalog.insert_schedule(&schedule)?;
    tracing::info!(schedule_id = %schedule.id, cron = %schedule.cron_expression, "Schedule created");
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn get_schedule(
    State(hub): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(hub.catalog.get_schedule(&id)?))
}

pub async fn update_schedule(
    State(hub): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Schedule>> {
    let patch: SchedulePatch = decode(body)?;
    Ok(Json(hub.catalog.update_schedule(&id, patch, hub.clock.now())?))
}

pub async fn delete_schedule(
    State(hub): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    hub.catalog.delete_schedule(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// Push targets

pub async fn list_push_targets(State(hub): State<AppState>) -> ApiResult<Json<Vec<PushTarget>>> {
    Ok(Json(hub.catalog.list_push_targets()?))
}

pub async fn create_push_target(
    State(hub): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<PushTarget>)> {
    let spec: PushTargetSpec = decode(body)?;
    let target = spec.into_target(new_id(), hub.clock.now())?;
    hub.catalog.insert_push_target(&target)?;
    Ok((StatusCode::CREATED, Json(target)))
}

pub async fn get_push_target(
    State(hub): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PushTarget>> {
    Ok(Json(hub.catalog.get_push_target(&id)?))
}

pub async fn update_push_target(
    State(hub): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<PushTarget>> {
    let patch: PushTargetPatch = decode(body)?;
    Ok(Json(hub.catalog.update_push_target(&id, patch, hub.clock.now())?))
}

pub async fn delete_push_target(
    State(hub): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    hub.catalog.delete_push_target(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
