//! Rule matcher and engine loop.
//!
//! For every appended event, in id order:
//! 1. select enabled rules whose type pattern, source filter and condition
//!    match
//! 2. drop rules still inside their cooldown window (event time)
//! 3. record the firing, then run all fired actions concurrently and wait
//!    for them before taking the next event

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::catalog::Catalog;
use super::executor::ActionExecutor;
use super::feed::ConsumerFeed;
use crate::domain::{Event, Rule, RuleExecutionRecord};
use crate::error::HubResult;

/// Why a rule did or did not fire for an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    Fire,
    NoMatch,
    CoolingDown { remaining_seconds: i64 },
    /// Condition could not be evaluated; treated as no match
    EvaluationFailed(String),
}

/// Decide whether `rule` fires for `event`
pub fn evaluate(rule: &Rule, event: &Event) -> MatchDecision {
    if !rule.enabled {
        return MatchDecision::NoMatch;
    }
    match rule.pattern() {
        Ok(pattern) if pattern.matches(&event.event_type) => {}
        Ok(_) => return MatchDecision::NoMatch,
        Err(e) => return MatchDecision::EvaluationFailed(e.to_string()),
    }
    if let Some(source) = &rule.source_filter {
        if source != &event.source {
            return MatchDecision::NoMatch;
        }
    }
    match rule.condition.evaluate(event) {
        Ok(true) => {}
        Ok(false) => return MatchDecision::NoMatch,
        Err(e) => return MatchDecision::EvaluationFailed(e.to_string()),
    }

    if rule.cooldown_seconds > 0 {
        if let Some(last) = rule.last_fired_at {
            let elapsed = (event.created_at - last).num_seconds();
            let cooldown = i64::try_from(rule.cooldown_seconds).unwrap_or(i64::MAX);
            if elapsed < cooldown {
                return MatchDecision::CoolingDown {
                    remaining_seconds: cooldown.saturating_sub(elapsed),
                };
            }
        }
    }
    MatchDecision::Fire
}

pub struct RuleEngine {
    catalog: Arc<Catalog>,
    executor: Arc<ActionExecutor>,
    /// Id of the last event the running engine finished
    progress: watch::Sender<i64>,
}

impl RuleEngine {
    pub fn new(catalog: Arc<Catalog>, executor: Arc<ActionExecutor>) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            catalog,
            executor,
            progress,
        }
    }

    /// Follow the engine's progress through the append stream
    pub fn progress(&self) -> watch::Receiver<i64> {
        self.progress.subscribe()
    }

    /// Enabled rules that fire for `event`, with skips logged
    pub fn matching_rules(&self, event: &Event) -> HubResult<Vec<Rule>> {
        let mut fired = Vec::new();
        for rule in self.catalog.enabled_rules()? {
            match evaluate(&rule, event) {
                MatchDecision::Fire => fired.push(rule),
                MatchDecision::NoMatch => {}
                MatchDecision::CoolingDown { remaining_seconds } => {
                    debug!(rule_id = %rule.id, event_id = event.id, remaining_seconds, "Rule in cooldown, skipping");
                }
                MatchDecision::EvaluationFailed(reason) => {
                    warn!(rule_id = %rule.id, event_id = event.id, %reason, "Condition evaluation failed, treating as no match");
                }
            }
        }
        Ok(fired)
    }

    /// Evaluate all rules for one event and run the fired actions
    pub async fn process(&self, event: &Event) -> HubResult<Vec<RuleExecutionRecord>> {
        let rules = self.matching_rules(event)?;
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let mut tasks = JoinSet::new();
        for rule in rules {
            self.catalog.record_rule_firing(&rule.id, event.created_at)?;
            info!(rule_id = %rule.id, rule = %rule.name, event_id = event.id, "Rule fired");

            let executor = Arc::clone(&self.executor);
            let event = event.clone();
            tasks.spawn(async move { executor.execute(&rule, &event).await });
        }

        let mut records = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(e) => warn!(event_id = event.id, error = %e, "Action task panicked"),
            }
        }
        Ok(records)
    }

    /// Consume the rule engine's feed until shutdown
    pub async fn run(self: Arc<Self>, mut feed: ConsumerFeed, mut shutdown: watch::Receiver<bool>) {
        info!(cursor = feed.cursor(), "Rule engine started");
        self.progress.send_replace(feed.cursor());
        while let Some(batch) = feed.next_batch(&mut shutdown).await {
            for event in batch {
                if let Err(e) = self.process(&event).await {
                    warn!(event_id = event.id, error = %e, "Rule evaluation failed");
                }
                feed.commit(event.id);
                self.progress.send_replace(event.id);
            }
        }
        info!("Rule engine stopped");
    }
}
