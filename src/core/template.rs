//! Payload templates for emit actions, webhooks and schedules.
//!
//! A template is any JSON value. Strings are scanned for `{path}`
//! placeholders resolved against a context document:
//! - a string that is exactly one placeholder becomes the resolved value,
//!   keeping its JSON type (`null` when unresolved)
//! - placeholders inside a longer string are interpolated as text
//!   (empty when unresolved)

use serde_json::{Map, Value};

use crate::domain::resolve_path;

/// Render `template` against `context`
pub fn render(template: &Value, context: &Value) -> Value {
    match template {
        Value::String(s) => render_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| render(v, context)).collect()),
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                out.insert(key.clone(), render(value, context));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn render_string(s: &str, context: &Value) -> Value {
    if let Some(path) = whole_placeholder(s) {
        return resolve_path(context, path).cloned().unwrap_or(Value::Null);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_path(&after[..end]) => {
                if let Some(value) = resolve_path(context, &after[..end]) {
                    out.push_str(&as_text(value));
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    is_path(inner).then_some(inner)
}

/// Placeholder paths are dot-separated identifiers; anything else is literal
/// text (so JSON snippets inside strings survive untouched).
fn is_path(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|seg| {
            !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
