//! Event-type glob patterns.
//!
//! Patterns are matched segment by segment on `.`:
//!
//! - a non-final `*` segment matches exactly one type segment
//! - a final `*` segment matches one or more remaining segments
//! - any other segment is a `glob::Pattern` matched against exactly one
//!   type segment, so `job_*` or `?` never cross a dot
//!
//! `dojo.*` therefore matches `dojo.job_failed` and `dojo.a.b` but not the
//! bare `dojo`, and a lone `*` matches every event type.

use glob::Pattern;

use crate::error::{HubError, HubResult};

#[derive(Debug, Clone)]
enum Segment {
    /// `*` in a non-final position
    One,
    /// `*` in the final position
    Rest,
    Glob(Pattern),
}

/// Compiled event-type pattern
#[derive(Debug, Clone)]
pub struct TypePattern {
    source: String,
    segments: Vec<Segment>,
}

impl TypePattern {
    pub fn new(pattern: &str) -> HubResult<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(HubError::configuration("event type pattern is empty"));
        }

        let raw: Vec<&str> = pattern.split('.').collect();
        let last = raw.len() - 1;
        let mut segments = Vec::with_capacity(raw.len());

        for (i, seg) in raw.iter().enumerate() {
            if seg.is_empty() {
                return Err(HubError::configuration(format!(
                    "event type pattern '{}' has an empty segment",
                    pattern
                )));
            }
            let compiled = match *seg {
                "*" if i == last => Segment::Rest,
                "*" => Segment::One,
                other => Segment::Glob(Pattern::new(other).map_err(|e| {
                    HubError::configuration(format!(
                        "invalid event type pattern '{}': {}",
                        pattern, e
                    ))
                })?),
            };
            segments.push(compiled);
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, event_type: &str) -> bool {
        let parts: Vec<&str> = event_type.split('.').collect();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest => return parts.len() > i,
                Segment::One => {
                    if parts.get(i).is_none() {
                        return false;
                    }
                }
                Segment::Glob(glob) => match parts.get(i) {
                    Some(part) if glob.matches(part) => {}
                    _ => return false,
                },
            }
        }

        parts.len() == self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, event_type: &str) -> bool {
        TypePattern::new(pattern).unwrap().matches(event_type)
    }

    #[test]
    fn test_trailing_star() {
        assert!(matches("dojo.*", "dojo.job_failed"));
        assert!(matches("dojo.*", "dojo.job_completed"));
        assert!(matches("dojo.*", "dojo.job.retry"));
        assert!(!matches("dojo.*", "sharingan.scroll_updated"));
        assert!(!matches("dojo.*", "dojo"));
        assert!(!matches("dojo.*", "dojothing.x"));
    }

    #[test]
    fn test_inner_star_is_single_segment() {
        assert!(matches("*.failed", "dojo.failed"));
        assert!(!matches("*.failed", "dojo.job.failed"));
        assert!(matches("a.*.c", "a.b.c"));
        assert!(!matches("a.*.c", "a.c"));
    }

    #[test]
    fn test_lone_star_matches_everything() {
        assert!(matches("*", "dojo"));
        assert!(matches("*", "dojo.job_failed"));
    }

    #[test]
    fn test_exact_and_partial_segments() {
        assert!(matches("dojo.job_failed", "dojo.job_failed"));
        assert!(!matches("dojo.job_failed", "dojo.job_failed.extra"));
        assert!(matches("dojo.job_*", "dojo.job_failed"));
        assert!(!matches("dojo.job_*", "dojo.task_failed"));
        assert!(!matches("dojo.job_*", "dojo.job_failed.x"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TypePattern::new("").is_err());
        assert!(TypePattern::new("dojo.").is_err());
        assert!(TypePattern::new("dojo.[").is_err());
    }
}
