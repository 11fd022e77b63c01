//! eventhub - Event hub with a declarative rules engine
//!
//! Producers append events over HTTP; the hub persists them in SQLite,
//! fans them out to live subscribers and drives three consumers off the
//! same log:
//! - a rule engine that matches events and runs actions (log, emit,
//!   webhook, pipeline tracking, resume push)
//! - a pipeline tracker that keeps per-job stage machines and flags stalls
//! - a cron scheduler that emits synthetic events
//!
//! # Modules
//!
//! - `adapters`: Webhook sender and external status providers
//! - `api`: axum HTTP surface
//! - `core`: Store, catalog, dispatcher, engine, tracker, scheduler
//! - `domain`: Data structures (Event, Rule, Pipeline, Schedule)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the hub
//! eventhub serve --bind 127.0.0.1:8787
//!
//! # Append an event
//! eventhub emit dojo.job_failed --source dojo --payload '{"job_id":"j1"}'
//!
//! # Inspect state
//! eventhub events --type-prefix dojo
//! eventhub pipelines
//! ```

pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use core::{Hub, HubOptions};
pub use domain::{Event, NewEvent, Pipeline, Rule, Schedule};
pub use error::{HubError, HubResult};
