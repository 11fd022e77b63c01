//! Cron-triggered synthetic events.

use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::validate_event_type;
use super::rule::{default_enabled, double_option};
use crate::error::{HubError, HubResult};

/// A cron-like trigger definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub payload_template: Value,
    pub enabled: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the last minute this schedule fired for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_minute: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn cron(&self) -> HubResult<CronExpr> {
        CronExpr::parse(&self.cron_expression)
    }
}

/// Parsed cron expression.
///
/// Standard 5-field expressions (`min hour dom mon dow`) are accepted and
/// normalised to the `cron` crate's seconds-first form with seconds fixed
/// at `0`, and their day-of-week uses crontab numbering (`0`-`7`, Sunday is
/// both `0` and `7`). 6 and 7 field expressions pass through unchanged and
/// follow the `cron` crate (`1-7` with Sunday = 1).
#[derive(Debug, Clone)]
pub struct CronExpr(cron::Schedule);

impl CronExpr {
    pub fn parse(expression: &str) -> HubResult<Self> {
        let fields = expression.split_whitespace().count();
        let normalised = match fields {
            5 => {
                let parts: Vec<&str> = expression.split_whitespace().collect();
                let day_of_week = crontab_day_of_week(parts[4]).map_err(|reason| {
                    HubError::configuration(format!(
                        "invalid cron expression '{}': day of week: {}",
                        expression, reason
                    ))
                })?;
                format!("0 {} {}", parts[..4].join(" "), day_of_week)
            }
            6 | 7 => expression.trim().to_string(),
            n => {
                return Err(HubError::configuration(format!(
                    "cron expression '{}' has {} fields, expected 5, 6 or 7",
                    expression, n
                )))
            }
        };

        cron::Schedule::from_str(&normalised)
            .map(Self)
            .map_err(|e| HubError::configuration(format!("invalid cron expression '{}': {}", expression, e)))
    }

    /// Does this expression fire within the minute starting at `minute`?
    pub fn matches_minute(&self, minute: DateTime<Utc>) -> bool {
        let start = truncate_to_minute(minute);
        match start.checked_sub_signed(chrono::Duration::seconds(1)) {
            Some(before) => self
                .0
                .after(&before)
                .next()
                .map(|next| truncate_to_minute(next) == start)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Drop seconds and sub-second precision
pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Body of `POST /schedules`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub name: String,
    pub cron_expression: String,
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub payload_template: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduleSpec {
    pub fn into_schedule(self, id: String, now: DateTime<Utc>) -> HubResult<Schedule> {
        if self.name.trim().is_empty() {
            return Err(HubError::validation("schedule name is required"));
        }
        if self.source.trim().is_empty() {
            return Err(HubError::validation("schedule source is required"));
        }
        CronExpr::parse(&self.cron_expression)?;
        validate_event_type(&self.event_type)?;

        Ok(Schedule {
            id,
            name: self.name,
            cron_expression: self.cron_expression,
            event_type: self.event_type,
            source: self.source,
            payload_template: self.payload_template,
            enabled: self.enabled,
            version: 1,
            created_at: now,
            updated_at: now,
            last_fired_minute: None,
        })
    }
}

/// Body of `PATCH /schedules/{id}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub event_type: Option<String>,
    pub source: Option<String>,
    #[serde(default, with = "double_option")]
    pub payload_template: Option<Option<Value>>,
    pub enabled: Option<bool>,
    pub version: Option<u64>,
}

impl SchedulePatch {
    pub fn apply(self, schedule: &mut Schedule, now: DateTime<Utc>) -> HubResult<()> {
        if let Some(expected) = self.version {
            if expected != schedule.version {
                return Err(HubError::Conflict {
                    kind: "schedule",
                    id: schedule.id.clone(),
                    expected,
                    actual: schedule.version,
                });
            }
        }
        if let Some(name) = self.name {
            if name.trim().is_empty() {
                return Err(HubError::validation("schedule name is required"));
            }
            schedule.name = name;
        }
        if let Some(expression) = self.cron_expression {
            CronExpr::parse(&expression)?;
            schedule.cron_expression = expression;
        }
        if let Some(event_type) = self.event_type {
            validate_event_type(&event_type)?;
            schedule.event_type = event_type;
        }
        if let Some(source) = self.source {
            if source.trim().is_empty() {
                return Err(HubError::validation("schedule source is required"));
            }
            schedule.source = source;
        }
        if let Some(template) = self.payload_template {
            schedule.payload_template = template.unwrap_or(Value::Null);
        }
        if let Some(enabled) = self.enabled {
            schedule.enabled = enabled;
        }
        schedule.version += 1;
        schedule.updated_at = now;
        Ok(())
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a crontab day-of-week field as an explicit list of day names.
///
/// Accepts `*`, lists, ranges, steps and three-letter names.
fn crontab_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("bad step '{}'", step))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_day(a)?, parse_day(b)?)
        } else {
            let day = parse_day(range)?;
            // `n/step` runs to the end of the week
            (day, if step.is_some() { 6 } else { day })
        };
        if start > end {
            return Err(format!("range '{}' runs backwards", range));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    Ok(DAY_NAMES
        .iter()
        .zip(days)
        .filter(|(_, on)| *on)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(","))
}

/// Crontab day: `0`-`7` (both ends Sunday) or a three-letter name
fn parse_day(token: &str) -> Result<usize, String> {
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day '{}' out of range", token))
        };
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| format!("unknown day '{}'", token))
}
