//! Action executor.
//!
//! Runs the action of a fired rule and writes exactly one execution record
//! per attempt, success or failure. Failures never propagate to the caller.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::catalog::Catalog;
use super::clock::Clock;
use super::ingest::Ingest;
use super::limits::HubLimits;
use super::resume::ResumeAggregator;
use super::template;
use super::tracker::PipelineTracker;
use crate::adapters::webhook::WebhookSender;
use crate::domain::{
    Action, Event, ExecutionResult, NewEvent, Rule, RuleExecutionRecord, CHAIN_DEPTH_EXCEEDED,
};

/// Source stamped on events emitted by rules without an explicit source
pub const RULES_SOURCE: &str = "eventhub.rules";

pub struct ActionExecutor {
    catalog: Arc<Catalog>,
    ingest: Arc<Ingest>,
    tracker: Arc<PipelineTracker>,
    resume: Arc<ResumeAggregator>,
    webhook: Arc<dyn WebhookSender>,
    clock: Arc<dyn Clock>,
    limits: HubLimits,
}

impl ActionExecutor {
    pub fn new(
        catalog: Arc<Catalog>,
        ingest: Arc<Ingest>,
        tracker: Arc<PipelineTracker>,
        resume: Arc<ResumeAggregator>,
        webhook: Arc<dyn WebhookSender>,
        clock: Arc<dyn Clock>,
        limits: HubLimits,
    ) -> Self {
        Self {
            catalog,
            ingest,
            tracker,
            resume,
            webhook,
            clock,
            limits,
        }
    }

    /// Run the rule's action for `event` and persist the audit record
    #[instrument(skip(self, rule, event), fields(rule_id = %rule.id, event_id = event.id))]
    pub async fn execute(&self, rule: &Rule, event: &Event) -> RuleExecutionRecord {
        let result = self.run_action(rule, event).await;
        if result.success {
            debug!(detail = %result.detail, "Action succeeded");
        } else {
            warn!(action = %rule.action.label(), detail = %result.detail, "Action failed");
        }

        let record = RuleExecutionRecord {
            id: 0,
            rule_id: rule.id.clone(),
            triggering_event_id: event.id,
            action_taken: rule.action.label(),
            result,
            fired_at: self.clock.now(),
        };
        match self.catalog.insert_execution(&record) {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, "Failed to persist execution record");
                record
            }
        }
    }

    async fn run_action(&self, rule: &Rule, event: &Event) -> ExecutionResult {
        match &rule.action {
            Action::Log { level, message } => {
                let message = match message {
                    Some(tpl) => match template::render(&Value::String(tpl.clone()), &event.context()) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    },
                    None => format!("Rule '{}' matched {}", rule.name, event.event_type),
                };
                match level.as_deref() {
                    Some("debug") => debug!(rule = %rule.name, event_id = event.id, "{}", message),
                    Some("warn") => warn!(rule = %rule.name, event_id = event.id, "{}", message),
                    Some("error") => error!(rule = %rule.name, event_id = event.id, "{}", message),
                    _ => info!(rule = %rule.name, event_id = event.id, "{}", message),
                }
                ExecutionResult::success(message)
            }

            Action::Emit {
                event_type,
                source,
                payload_template,
            } => {
                let hops = event.hops + 1;
                if let Err(violation) = self.limits.check_hops(hops) {
                    warn!(%violation, "Refusing to emit");
                    return ExecutionResult::failure(CHAIN_DEPTH_EXCEEDED);
                }

                let payload = match payload_template {
                    Value::Null => serde_json::json!({}),
                    tpl => template::render(tpl, &event.context()),
                };
                let new = NewEvent::new(
                    event_type.clone(),
                    source.clone().unwrap_or_else(|| RULES_SOURCE.to_string()),
                    payload,
                )
                .with_hops(hops);

                match self.ingest.append(new) {
                    Ok(appended) => ExecutionResult::success(format!("emitted event {}", appended.event.id)),
                    Err(e) => ExecutionResult::failure(format!("emit failed: {}", e)),
                }
            }

            Action::Webhook {
                url,
                payload_template,
            } => {
                let body = match payload_template {
                    Some(tpl) => template::render(tpl, &event.context()),
                    None => match serde_json::to_value(event) {
                        Ok(v) => v,
                        Err(e) => return ExecutionResult::failure(format!("serialize event: {}", e)),
                    },
                };
                match self
                    .webhook
                    .post(url, &body, self.limits.webhook_timeout())
                    .await
                {
                    Ok(response) => ExecutionResult::success(format!("HTTP {}", response.status)),
                    Err(e) => ExecutionResult::failure(format!("{:#}", e)),
                }
            }

            Action::PipelineTrack => match self.tracker.request(event) {
                Ok(()) => ExecutionResult::success("queued for tracking"),
                Err(e) => ExecutionResult::failure(format!("tracking failed: {}", e)),
            },

            Action::ResumePush => match self.resume.push_all().await {
                Ok((_, outcomes)) => {
                    let detail = outcomes
                        .iter()
                        .map(|o| {
                            format!(
                                "{}:{}",
                                o.target_id,
                                if o.success { "ok" } else { o.detail.as_str() }
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("; ");
                    if outcomes.iter().all(|o| o.success) {
                        ExecutionResult::success(format!("pushed to {} targets {}", outcomes.len(), detail))
                    } else {
                        ExecutionResult::failure(detail)
                    }
                }
                Err(e) => ExecutionResult::failure(format!("snapshot failed: {}", e)),
            },
        }
    }
}
