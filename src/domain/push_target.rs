//! Destinations for resume snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rule::{default_enabled, validate_url};
use crate::error::{HubError, HubResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushTargetType {
    /// Atomic write-then-rename to a local path
    File,
    /// JSON POST to a URL
    Webhook,
}

impl PushTargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Webhook => "webhook",
        }
    }
}

impl std::str::FromStr for PushTargetType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "webhook" => Ok(Self::Webhook),
            other => Err(HubError::validation(format!("unknown push target type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: PushTargetType,
    pub destination: String,
    pub enabled: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_destination(target_type: PushTargetType, destination: &str) -> HubResult<()> {
    if destination.trim().is_empty() {
        return Err(HubError::validation("push target destination is required"));
    }
    match target_type {
        PushTargetType::Webhook => validate_url(destination),
        PushTargetType::File => {
            if destination.ends_with('/') {
                return Err(HubError::validation(
                    "file push target destination must be a file path",
                ));
            }
            Ok(())
        }
    }
}

/// Body of `POST /push-targets`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTargetSpec {
    #[serde(rename = "type")]
    pub target_type: PushTargetType,
    pub destination: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl PushTargetSpec {
    pub fn into_target(self, id: String, now: DateTime<Utc>) -> HubResult<PushTarget> {
        validate_destination(self.target_type, &self.destination)?;
        Ok(PushTarget {
            id,
            target_type: self.target_type,
            destination: self.destination,
            enabled: self.enabled,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Body of `PATCH /push-targets/{id}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushTargetPatch {
    #[serde(rename = "type")]
    pub target_type: Option<PushTargetType>,
    pub destination: Option<String>,
    pub enabled: Option<bool>,
    pub version: Option<u64>,
}

impl PushTargetPatch {
    pub fn apply(self, target: &mut PushTarget, now: DateTime<Utc>) -> HubResult<()> {
        if let Some(expected) = self.version {
            if expected != target.version {
                return Err(HubError::Conflict {
                    kind: "push target",
                    id: target.id.clone(),
                    expected,
                    actual: target.version,
                });
            }
        }
        let target_type = self.target_type.unwrap_or(target.target_type);
        let destination = self.destination.unwrap_or_else(|| target.destination.clone());
        validate_destination(target_type, &destination)?;

        target.target_type = target_type;
        target.destination = destination;
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        target.version += 1;
        target.updated_at = now;
        Ok(())
    }
}
