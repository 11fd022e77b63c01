//! Rule execution audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one attempted action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub detail: String,
}

impl ExecutionResult {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// One audit entry per attempted action; never mutated after insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecutionRecord {
    /// Assigned by the catalog on insert (0 before persisting)
    pub id: i64,
    pub rule_id: String,
    pub triggering_event_id: i64,
    pub action_taken: String,
    pub result: ExecutionResult,
    pub fired_at: DateTime<Utc>,
}

/// Detail recorded when an emit action would exceed the hop limit
pub const CHAIN_DEPTH_EXCEEDED: &str = "chain_depth_exceeded";
