//! Runtime limits for the side-effect path.
//!
//! Bounds runaway behaviour through configurable limits on:
//! - Rule chain depth (emit actions re-entering ingest)
//! - Outbound HTTP timeouts
//! - In-memory buffer sizes for subscribers and consumers

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied by the executor, dispatcher and consumer feeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubLimits {
    /// Maximum hop count an emitted event may carry (default: 5)
    #[serde(default = "default_max_chain_hops")]
    pub max_chain_hops: u32,

    /// Timeout for webhook actions and webhook push targets (default: 10s)
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_seconds: u64,

    /// Per-subscriber buffer before the subscriber is disconnected (default: 256)
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Per-consumer hand-off buffer before it falls back to the store (default: 1024)
    #[serde(default = "default_consumer_buffer")]
    pub consumer_buffer: usize,

    /// How often consumers poll the store for missed events (default: 5s)
    #[serde(default = "default_catchup_interval")]
    pub catchup_interval_seconds: u64,
}

fn default_max_chain_hops() -> u32 {
    5
}
fn default_webhook_timeout() -> u64 {
    10
}
fn default_subscriber_buffer() -> usize {
    256
}
fn default_consumer_buffer() -> usize {
    1024
}
fn default_catchup_interval() -> u64 {
    5
}

impl Default for HubLimits {
    fn default() -> Self {
        Self {
            max_chain_hops: default_max_chain_hops(),
            webhook_timeout_seconds: default_webhook_timeout(),
            subscriber_buffer: default_subscriber_buffer(),
            consumer_buffer: default_consumer_buffer(),
            catchup_interval_seconds: default_catchup_interval(),
        }
    }
}

impl HubLimits {
    /// Check the hop count an emit would produce
    pub fn check_hops(&self, next_hops: u32) -> Result<(), LimitViolation> {
        if next_hops > self.max_chain_hops {
            return Err(LimitViolation::ChainDepth {
                actual: next_hops,
                limit: self.max_chain_hops,
            });
        }
        Ok(())
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_seconds)
    }

    pub fn catchup_interval(&self) -> Duration {
        Duration::from_secs(self.catchup_interval_seconds.max(1))
    }
}

/// Limit violations
#[derive(Debug, Clone, Error)]
pub enum LimitViolation {
    #[error("Chain depth exceeded: {actual} > {limit}")]
    ChainDepth { actual: u32, limit: u32 },
}
