//! Declarative rule conditions.
//!
//! A condition is a map from field path to operator spec:
//!
//! ```json
//! { "payload.retry_count": { "$gt": 2 }, "status": "failed" }
//! ```
//!
//! A bare value is shorthand for `$eq`. An object may carry several `$op`
//! keys, all of which must hold. Every entry must hold for the condition to
//! match. A path that does not resolve makes the whole condition false.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::events::Event;
use crate::error::{HubError, HubResult};

/// Comparison operator with its operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Lt(Value),
    Gte(Value),
    Lte(Value),
    Contains(Value),
    In(Vec<Value>),
}

impl Operator {
    fn parse(name: &str, operand: Value) -> HubResult<Self> {
        let op = match name {
            "$eq" => Self::Eq(operand),
            "$ne" => Self::Ne(operand),
            "$gt" => Self::Gt(ordered_operand(name, operand)?),
            "$lt" => Self::Lt(ordered_operand(name, operand)?),
            "$gte" => Self::Gte(ordered_operand(name, operand)?),
            "$lte" => Self::Lte(ordered_operand(name, operand)?),
            "$contains" => Self::Contains(operand),
            "$in" => match operand {
                Value::Array(items) => Self::In(items),
                other => {
                    return Err(HubError::configuration(format!(
                        "$in requires an array operand, got {}",
                        other
                    )))
                }
            },
            other => {
                return Err(HubError::configuration(format!(
                    "unknown condition operator '{}'",
                    other
                )))
            }
        };
        Ok(op)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Lt(_) => "$lt",
            Self::Gte(_) => "$gte",
            Self::Lte(_) => "$lte",
            Self::Contains(_) => "$contains",
            Self::In(_) => "$in",
        }
    }

    fn operand(&self) -> Value {
        match self {
            Self::Eq(v)
            | Self::Ne(v)
            | Self::Gt(v)
            | Self::Lt(v)
            | Self::Gte(v)
            | Self::Lte(v)
            | Self::Contains(v) => v.clone(),
            Self::In(items) => Value::Array(items.clone()),
        }
    }

    /// Apply the operator to a resolved value
    pub fn apply(&self, actual: &Value) -> HubResult<bool> {
        match self {
            Self::Eq(expected) => Ok(values_equal(actual, expected)),
            Self::Ne(expected) => Ok(!values_equal(actual, expected)),
            Self::Gt(bound) => Ok(compare(actual, bound)? == Ordering::Greater),
            Self::Lt(bound) => Ok(compare(actual, bound)? == Ordering::Less),
            Self::Gte(bound) => Ok(compare(actual, bound)? != Ordering::Less),
            Self::Lte(bound) => Ok(compare(actual, bound)? != Ordering::Greater),
            Self::Contains(needle) => contains(actual, needle),
            Self::In(items) => Ok(items.iter().any(|item| values_equal(actual, item))),
        }
    }
}

fn ordered_operand(name: &str, operand: Value) -> HubResult<Value> {
    match operand {
        Value::Number(_) | Value::String(_) => Ok(operand),
        other => Err(HubError::configuration(format!(
            "{} requires a number or string operand, got {}",
            name, other
        ))),
    }
}

/// JSON equality with numeric comparison across integer/float representations
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn compare(actual: &Value, bound: &Value) -> HubResult<Ordering> {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            a.zip(b)
                .and_then(|(a, b)| a.partial_cmp(&b))
                .ok_or_else(|| HubError::Evaluation("numbers are not comparable".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(HubError::Evaluation(format!(
            "cannot order {} against {}",
            type_name(actual),
            type_name(bound)
        ))),
    }
}

fn contains(actual: &Value, needle: &Value) -> HubResult<bool> {
    match (actual, needle) {
        (Value::String(haystack), Value::String(n)) => Ok(haystack.contains(n.as_str())),
        (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(HubError::Evaluation(format!(
            "$contains is not defined for {} and {}",
            type_name(actual),
            type_name(needle)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolve a dotted path into a JSON document.
///
/// Numeric segments index into arrays. Returns `None` when any segment is
/// missing.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve a condition path against an event.
///
/// `payload.*` resolves into the payload, a few top-level names resolve to
/// event attributes, and anything else is looked up in the payload.
pub fn resolve_event_field(event: &Event, path: &str) -> Option<Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    match (head, rest) {
        ("payload", Some(rest)) => resolve_path(&event.payload, rest).cloned(),
        ("payload", None) => Some(event.payload.clone()),
        ("type", None) => Some(Value::String(event.event_type.clone())),
        ("source", None) => Some(Value::String(event.source.clone())),
        ("id", None) => Some(Value::from(event.id)),
        ("hops", None) => Some(Value::from(event.hops)),
        _ => resolve_path(&event.payload, path).cloned(),
    }
}

/// One `path -> operator` check
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub path: String,
    pub operator: Operator,
}

/// Conjunction of predicates; empty means "always true"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Condition {
    predicates: Vec<Predicate>,
}

impl Condition {
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Parse a condition document, rejecting unknown operators and bad paths
    pub fn parse(value: Value) -> HubResult<Self> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => {
                return Err(HubError::configuration(format!(
                    "condition must be an object, got {}",
                    other
                )))
            }
        };

        let mut predicates = Vec::new();
        for (path, spec) in map {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(HubError::configuration(format!(
                    "condition path '{}' has an empty segment",
                    path
                )));
            }

            match spec {
                Value::Object(ops) if is_operator_object(&ops) => {
                    for (name, operand) in ops {
                        predicates.push(Predicate {
                            path: path.clone(),
                            operator: Operator::parse(&name, operand)?,
                        });
                    }
                }
                other => predicates.push(Predicate {
                    path,
                    operator: Operator::Eq(other),
                }),
            }
        }

        Ok(Self { predicates })
    }

    /// Evaluate against an event.
    ///
    /// Absent paths yield `Ok(false)`. Type mismatches yield an
    /// `Evaluation` error; callers treat that as a non-match.
    pub fn evaluate(&self, event: &Event) -> HubResult<bool> {
        for predicate in &self.predicates {
            let Some(actual) = resolve_event_field(event, &predicate.path) else {
                return Ok(false);
            };
            if !predicate.operator.apply(&actual)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// An object whose keys all start with `$` is an operator spec; any other
/// object is an equality operand.
fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

impl TryFrom<Value> for Condition {
    type Error = HubError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Condition> for Value {
    fn from(condition: Condition) -> Self {
        let mut out = Map::new();
        for predicate in condition.predicates {
            let entry = out
                .entry(predicate.path)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ops) = entry {
                ops.insert(
                    predicate.operator.name().to_string(),
                    predicate.operator.operand(),
                );
            }
        }
        Value::Object(out)
    }
}
