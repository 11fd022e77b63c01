//! Core hub logic.
//!
//! This module contains:
//! - EventStore: Append-only, durable event log
//! - Catalog: Rules, schedules, push targets, pipelines, execution log
//! - Dispatcher / Ingest / ConsumerFeed: fan-out of appended events
//! - RuleEngine / ActionExecutor: reactive rules
//! - PipelineTracker: per-job stage machines and stall detection
//! - Scheduler: cron-driven synthetic events
//! - ResumeAggregator: composite status snapshot
//! - Hub: wiring and background tasks

pub mod catalog;
pub mod clock;
pub mod dispatcher;
pub mod event_store;
pub mod executor;
pub mod feed;
pub mod hub;
pub mod ingest;
pub mod limits;
pub mod matcher;
pub mod resume;
pub mod scheduler;
pub mod template;
pub mod tracker;

// Re-export commonly used types
pub use catalog::Catalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{Dispatcher, EventFilter, Subscription};
pub use event_store::{dedupe_key, Appended, EventQuery, EventStore};
pub use executor::ActionExecutor;
pub use feed::ConsumerFeed;
pub use hub::{Hub, HubOptions};
pub use ingest::Ingest;
pub use limits::{HubLimits, LimitViolation};
pub use matcher::{evaluate, MatchDecision, RuleEngine};
pub use resume::{PushOutcome, ResumeAggregator, ResumeSnapshot};
pub use scheduler::{Scheduler, SchedulerStats};
pub use tracker::{PipelineTracker, TrackOutcome, TrackerConfig};
