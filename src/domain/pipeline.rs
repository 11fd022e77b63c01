//! Pipeline state machine types.
//!
//! A Pipeline is one tracked job moving through an ordered list of stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Default stage order for content jobs
pub const DEFAULT_STAGES: &[&str] = &["pending", "tts", "avatar", "broll", "review", "uploaded"];

/// Tracked state-machine instance for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub job_id: String,
    pub stage: String,
    pub last_transition_at: DateTime<Utc>,
    pub stalled: bool,
    pub created_at: DateTime<Utc>,
    /// Highest event id applied to this pipeline
    pub last_event_id: i64,
}

/// One recorded stage change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<String>,
    pub to_stage: String,
    pub event_id: i64,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub reset: bool,
}

/// Pipeline plus its ordered transition history
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDetail {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub transitions: Vec<Transition>,
}

/// Aggregate counters for `GET /pipelines/stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub total: usize,
    pub stalled: usize,
    pub terminal: usize,
    /// Count per stage, in stage order
    pub by_stage: Vec<StageCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageCount {
    pub stage: String,
    pub count: usize,
}

/// Ordered stage list with its terminal subset
#[derive(Debug, Clone, PartialEq)]
pub struct StageSet {
    stages: Vec<String>,
    terminal: Vec<String>,
}

impl Default for StageSet {
    fn default() -> Self {
        Self {
            stages: DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
            terminal: vec!["uploaded".to_string()],
        }
    }
}

impl StageSet {
    /// Build a stage set; when `terminal` is empty the last stage is terminal
    pub fn new(stages: Vec<String>, terminal: Vec<String>) -> HubResult<Self> {
        if stages.is_empty() {
            return Err(HubError::configuration("pipeline stage list is empty"));
        }
        for (i, stage) in stages.iter().enumerate() {
            if stage.trim().is_empty() {
                return Err(HubError::configuration("pipeline stage names must not be blank"));
            }
            if stages[..i].contains(stage) {
                return Err(HubError::configuration(format!(
                    "pipeline stage '{}' is listed twice",
                    stage
                )));
            }
        }
        for stage in &terminal {
            if !stages.contains(stage) {
                return Err(HubError::configuration(format!(
                    "terminal stage '{}' is not in the stage list",
                    stage
                )));
            }
        }

        let terminal = if terminal.is_empty() {
            stages.last().cloned().into_iter().collect()
        } else {
            terminal
        };

        Ok(Self { stages, terminal })
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn first(&self) -> &str {
        &self.stages[0]
    }

    pub fn index_of(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn is_terminal(&self, stage: &str) -> bool {
        self.terminal.iter().any(|s| s == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stage_set() {
        let set = StageSet::default();
        assert_eq!(set.first(), "pending");
        assert_eq!(set.index_of("avatar"), Some(2));
        assert!(set.is_terminal("uploaded"));
        assert!(!set.is_terminal("review"));
    }

    #[test]
    fn test_last_stage_terminal_by_default() {
        let set = StageSet::new(vec!["a".into(), "b".into()], vec![]).unwrap();
        assert!(set.is_terminal("b"));
    }

    #[test]
    fn test_invalid_stage_sets() {
        assert!(StageSet::new(vec![], vec![]).is_err());
        assert!(StageSet::new(vec!["a".into(), "a".into()], vec![]).is_err());
        assert!(StageSet::new(vec!["a".into()], vec!["z".into()]).is_err());
    }
}
