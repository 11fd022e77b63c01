//! Rules: reactive policies evaluated against every appended event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::Condition;
use super::events::validate_event_type;
use super::pattern::TypePattern;
use crate::error::{HubError, HubResult};

/// A user-declared rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub event_type_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filter: Option<String>,
    #[serde(default)]
    pub condition: Condition,
    pub action: Action,
    #[serde(default)]
    pub cooldown_seconds: u64,
    pub enabled: bool,
    /// Optimistic concurrency counter, bumped on every update
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Compiled type pattern; rules are validated on write so this only
    /// fails for rows edited outside the API.
    pub fn pattern(&self) -> HubResult<TypePattern> {
        TypePattern::new(&self.event_type_pattern)
    }
}

/// Side effect to run when a rule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Write a structured log line
    Log {
        /// `debug`, `info` (default), `warn` or `error`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Append a new event built from a template
    Emit {
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        payload_template: Value,
    },

    /// POST the templated payload (or the triggering event) to a URL
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_template: Option<Value>,
    },

    /// Forward the event to the pipeline tracker
    PipelineTrack,

    /// Push the resume snapshot to every enabled push target
    ResumePush,
}

impl Action {
    /// Short label used in execution records
    pub fn label(&self) -> String {
        match self {
            Self::Log { .. } => "log".to_string(),
            Self::Emit { event_type, .. } => format!("emit:{}", event_type),
            Self::Webhook { url, .. } => format!("webhook:{}", url),
            Self::PipelineTrack => "pipeline_track".to_string(),
            Self::ResumePush => "resume_push".to_string(),
        }
    }

    fn validate(&self) -> HubResult<()> {
        match self {
            Self::Emit { event_type, .. } => validate_event_type(event_type)
                .map_err(|e| HubError::configuration(format!("emit action: {}", e))),
            Self::Webhook { url, .. } => validate_url(url),
            Self::Log {
                level: Some(level), ..
            } => match level.as_str() {
                "debug" | "info" | "warn" | "error" => Ok(()),
                other => Err(HubError::configuration(format!(
                    "log action: unknown level '{}'",
                    other
                ))),
            },
            _ => Ok(()),
        }
    }
}

pub(crate) fn validate_url(url: &str) -> HubResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| HubError::configuration(format!("invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(HubError::configuration(format!(
            "unsupported URL scheme '{}'",
            other
        ))),
    }
}

/// Body of `POST /rules`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub event_type_pattern: String,
    #[serde(default)]
    pub source_filter: Option<String>,
    #[serde(default)]
    pub condition: Value,
    pub action: Action,
    #[serde(default)]
    pub cooldown_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

pub(crate) fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    /// Validate and build a new rule
    pub fn into_rule(self, id: String, now: DateTime<Utc>) -> HubResult<Rule> {
        if self.name.trim().is_empty() {
            return Err(HubError::validation("rule name is required"));
        }
        TypePattern::new(&self.event_type_pattern)?;
        let condition = Condition::parse(self.condition)?;
        self.action.validate()?;

        Ok(Rule {
            id,
            name: self.name,
            event_type_pattern: self.event_type_pattern,
            source_filter: self.source_filter.filter(|s| !s.is_empty()),
            condition,
            action: self.action,
            cooldown_seconds: self.cooldown_seconds,
            enabled: self.enabled,
            version: 1,
            created_at: now,
            updated_at: now,
            last_fired_at: None,
        })
    }
}

/// Body of `PATCH /rules/{id}`; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub event_type_pattern: Option<String>,
    /// `Some(None)` clears the filter
    #[serde(default, with = "double_option")]
    pub source_filter: Option<Option<String>>,
    pub condition: Option<Value>,
    pub action: Option<Action>,
    pub cooldown_seconds: Option<u64>,
    pub enabled: Option<bool>,
    /// Expected current version; mismatches are rejected
    pub version: Option<u64>,
}

impl RulePatch {
    /// Apply to an existing rule, validating every changed field
    pub fn apply(self, rule: &mut Rule, now: DateTime<Utc>) -> HubResult<()> {
        if let Some(expected) = self.version {
            if expected != rule.version {
                return Err(HubError::Conflict {
                    kind: "rule",
                    id: rule.id.clone(),
                    expected,
                    actual: rule.version,
                });
            }
        }
        if let Some(name) = self.name {
            if name.trim().is_empty() {
                return Err(HubError::validation("rule name is required"));
            }
            rule.name = name;
        }
        if let Some(pattern) = self.event_type_pattern {
            TypePattern::new(&pattern)?;
            rule.event_type_pattern = pattern;
        }
        if let Some(filter) = self.source_filter {
            rule.source_filter = filter.filter(|s| !s.is_empty());
        }
        if let Some(condition) = self.condition {
            rule.condition = Condition::parse(condition)?;
        }
        if let Some(action) = self.action {
            action.validate()?;
            rule.action = action;
        }
        if let Some(cooldown) = self.cooldown_seconds {
            rule.cooldown_seconds = cooldown;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        rule.version += 1;
        rule.updated_at = now;
        Ok(())
    }
}

/// Distinguishes an absent field from an explicit `null`
pub(crate) mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
