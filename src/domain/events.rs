//! Event types for the hub.
//!
//! Events are immutable facts recorded in the append-only store. The store
//! assigns `id` and `created_at`; producers only supply type, source and
//! payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HubError, HubResult};

/// A single event in the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned sequence number (monotonic, gap-free)
    pub id: i64,

    /// Dot-namespaced event type, e.g. `dojo.job_failed`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Producer identifier
    pub source: String,

    /// Arbitrary structured payload (always a JSON object)
    pub payload: Value,

    /// Server-assigned timestamp, authoritative for ordering
    pub created_at: DateTime<Utc>,

    /// Number of emit actions between an external producer and this event
    #[serde(default)]
    pub hops: u32,

    /// Producer-supplied dedupe key, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Event {
    /// Look up a top-level payload field
    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// The `job_id` this event refers to, if any (strings and numbers accepted)
    pub fn job_id(&self) -> Option<String> {
        match self.payload.get("job_id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Template/condition context: the event as a JSON document
    pub fn context(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.event_type,
            "source": self.source,
            "created_at": self.created_at.to_rfc3339(),
            "hops": self.hops,
            "payload": self.payload,
        })
    }
}

/// An event as submitted by a producer, before the store accepts it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Chain depth; never accepted from external producers
    #[serde(skip)]
    pub hops: u32,
}

impl NewEvent {
    /// Create a new event with an object payload
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            payload,
            idempotency_key: None,
            hops: 0,
        }
    }

    /// Attach a producer dedupe key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the rule-chain depth
    pub fn with_hops(mut self, hops: u32) -> Self {
        self.hops = hops;
        self
    }

    /// Check required fields and normalise the payload.
    ///
    /// A missing (`null`) payload becomes `{}`; any other non-object payload
    /// is rejected.
    pub fn validate(&mut self) -> HubResult<()> {
        self.event_type = self.event_type.trim().to_string();
        self.source = self.source.trim().to_string();

        if self.event_type.is_empty() {
            return Err(HubError::validation("event type is required"));
        }
        if self.source.is_empty() {
            return Err(HubError::validation("event source is required"));
        }
        validate_event_type(&self.event_type)?;

        match self.payload {
            Value::Null => self.payload = Value::Object(Map::new()),
            Value::Object(_) => {}
            _ => return Err(HubError::validation("event payload must be a JSON object")),
        }

        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(HubError::validation("idempotency_key must not be blank"));
            }
        }

        Ok(())
    }
}

/// Event types are one or more non-empty dot-separated segments
pub fn validate_event_type(event_type: &str) -> HubResult<()> {
    if event_type.chars().any(char::is_whitespace) {
        return Err(HubError::validation(format!(
            "event type '{}' must not contain whitespace",
            event_type
        )));
    }
    if event_type.split('.').any(str::is_empty) {
        return Err(HubError::validation(format!(
            "event type '{}' has an empty segment",
            event_type
        )));
    }
    Ok(())
}
