//! Error taxonomy for the hub.
//!
//! Ingest-path errors are returned to the caller synchronously. Errors in
//! the side-effect path (matcher, executor, tracker, scheduler) are logged
//! and recorded but never fail an append.

use thiserror::Error;

/// Result alias used across the library
pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed event, rule, schedule or push target; never persisted
    #[error("Validation error: {0}")]
    Validation(String),

    /// A condition could not be evaluated against an event
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// An action ran and failed (webhook timeout, chain depth exceeded, ...)
    #[error("Action execution error: {0}")]
    ActionExecution(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed rule/schedule definition rejected at creation time
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Version conflict on {kind} {id}: expected {expected}, found {actual}")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },
}

impl HubError {
    /// Short machine-readable label, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Evaluation(_) => "evaluation_error",
            Self::ActionExecution(_) => "action_execution_error",
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => "storage_error",
            Self::Configuration(_) => "configuration_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(HubError::validation("x").kind(), "validation_error");
        assert_eq!(HubError::configuration("x").kind(), "configuration_error");
        assert_eq!(HubError::not_found("rule", "r1").kind(), "not_found");
        assert_eq!(
            HubError::Storage(rusqlite::Error::QueryReturnedNoRows).kind(),
            "storage_error"
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = HubError::not_found("rule", "abc");
        assert_eq!(err.to_string(), "rule not found: abc");
    }
}
