//! Domain types for the hub.
//!
//! This module contains the core data structures:
//! - Events: immutable facts and their ingest form
//! - Rules: patterns, conditions and actions
//! - Pipelines: per-job stage machines
//! - Schedules and push targets: administrative configuration
//! - Execution records: the rule audit log

pub mod condition;
pub mod events;
pub mod execution;
pub mod pattern;
pub mod pipeline;
pub mod push_target;
pub mod rule;
pub mod schedule;

// Re-export commonly used types
pub use condition::{resolve_path, Condition, Operator};
pub use events::{Event, NewEvent};
pub use execution::{ExecutionResult, RuleExecutionRecord, CHAIN_DEPTH_EXCEEDED};
pub use pattern::TypePattern;
pub use pipeline::{Pipeline, PipelineDetail, PipelineStats, StageSet, Transition};
pub use push_target::{PushTarget, PushTargetPatch, PushTargetSpec, PushTargetType};
pub use rule::{Action, Rule, RulePatch, RuleSpec};
pub use schedule::{CronExpr, Schedule, SchedulePatch, ScheduleSpec};
