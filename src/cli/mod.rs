//! Command-line interface for eventhub.
//!
//! `serve` runs the hub and its HTTP API. The other commands work directly
//! against the database, so they can be used while a server is running.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api;
use crate::config::{self, ResolvedConfig};
use crate::core::{Catalog, EventQuery, EventStore, Hub, HubOptions, SystemClock};
use crate::domain::NewEvent;

/// eventhub - Event hub with rules, pipelines and schedules
#[derive(Parser, Debug)]
#[command(name = "eventhub")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the hub and its HTTP API
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long, env = "EVENTHUB_BIND")]
        bind: Option<String>,
    },

    /// Append an event
    Emit {
        /// Event type, e.g. dojo.job_failed
        event_type: String,

        /// Producer identifier
        #[arg(short, long, default_value = "cli")]
        source: String,

        /// JSON object payload
        #[arg(short, long)]
        payload: Option<String>,

        /// Idempotency key
        #[arg(short = 'k', long)]
        key: Option<String>,
    },

    /// List recent events, newest first
    Events {
        /// Only types starting with this prefix
        #[arg(short = 't', long)]
        type_prefix: Option<String>,

        /// Only events from this source
        #[arg(short, long)]
        source: Option<String>,

        /// Maximum number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List tracked pipelines
    Pipelines,

    /// List rules
    Rules,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { bind } => serve(bind).await,
            Commands::Emit {
                event_type,
                source,
                payload,
                key,
            } => emit(&event_type, &source, payload.as_deref(), key),
            Commands::Events {
                type_prefix,
                source,
                limit,
            } => list_events(type_prefix, source, limit),
            Commands::Pipelines => list_pipelines(),
            Commands::Rules => list_rules(),
            Commands::Config => show_config(),
        }
    }
}

/// Run the hub until ctrl-c.
///
/// Holds an exclusive lock on the state directory so two servers never
/// share one database.
async fn serve(bind: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let bind = bind.unwrap_or_else(|| cfg.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", bind))?;

    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create {}", cfg.home.display()))?;
    let lock_path = cfg.lock_path();
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
    lock_file
        .try_lock_exclusive()
        .with_context(|| format!("Another eventhub server holds {}", lock_path.display()))?;

    let options = HubOptions::from_config(cfg)?;
    let hub = Arc::new(Hub::open(&cfg.database, options)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = hub.start(shutdown_rx.clone())?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, database = %cfg.database.display(), "eventhub listening");

    let signal_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            return;
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
        // Ends open SSE streams so the server can drain
        signal_hub.dispatcher.close();
    });

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, api::router(Arc::clone(&hub)))
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("HTTP server failed")?;

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    let _ = lock_file.unlock();
    info!("eventhub stopped");
    Ok(())
}

fn open_store(cfg: &ResolvedConfig) -> Result<EventStore> {
    EventStore::open(&cfg.database, Arc::new(SystemClock))
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))
}

fn open_catalog(cfg: &ResolvedConfig) -> Result<Catalog> {
    Catalog::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))
}

/// Parse a `--payload` argument; absent means an empty object
fn parse_payload(payload: Option<&str>) -> Result<Value> {
    match payload {
        None => Ok(Value::Null),
        Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON"),
    }
}

/// Append an event directly to the store.
///
/// A running server picks it up on its next catch-up tick.
fn emit(event_type: &str, source: &str, payload: Option<&str>, key: Option<String>) -> Result<()> {
    let cfg = config::config()?;
    let store = open_store(cfg)?;

    let mut new = NewEvent::new(event_type, source, parse_payload(payload)?);
    if let Some(key) = key {
        new = new.with_idempotency_key(key);
    }
    let appended = store.append(new)?;

    if appended.created {
        println!("Appended event {} ({})", appended.event.id, appended.event.event_type);
    } else {
        println!("Duplicate of event {} (idempotency key matched)", appended.event.id);
    }
    Ok(())
}

fn list_events(type_prefix: Option<String>, source: Option<String>, limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let store = open_store(cfg)?;
    let events = store.query(&EventQuery {
        type_prefix,
        source,
        limit: Some(limit),
        ..Default::default()
    })?;

    if events.is_empty() {
        println!("No events found");
        return Ok(());
    }

    println!("{:<8} {:<28} {:<32} {:<16}", "ID", "CREATED", "TYPE", "SOURCE");
    println!("{}", "-".repeat(86));
    for event in events {
        println!(
            "{:<8} {:<28} {:<32} {:<16}",
            event.id,
            event.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.event_type,
            event.source
        );
    }
    Ok(())
}

fn list_pipelines() -> Result<()> {
    let cfg = config::config()?;
    let catalog = open_catalog(cfg)?;
    let pipelines = catalog.list_pipelines()?;

    if pipelines.is_empty() {
        println!("No pipelines tracked");
        return Ok(());
    }

    println!("{:<24} {:<12} {:<28} {:<8}", "JOB ID", "STAGE", "LAST TRANSITION", "STALLED");
    println!("{}", "-".repeat(76));
    for p in pipelines {
        println!(
            "{:<24} {:<12} {:<28} {:<8}",
            p.job_id,
            p.stage,
            p.last_transition_at.format("%Y-%m-%d %H:%M:%S"),
            if p.stalled { "yes" } else { "" }
        );
    }
    Ok(())
}

fn list_rules() -> Result<()> {
    let cfg = config::config()?;
    let catalog = open_catalog(cfg)?;
    let rules = catalog.list_rules()?;

    if rules.is_empty() {
        println!("No rules defined");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<20} {:<8} {:<10}", "RULE ID", "NAME", "PATTERN", "ENABLED", "ACTION");
    println!("{}", "-".repeat(104));
    for rule in rules {
        println!(
            "{:<38} {:<24} {:<20} {:<8} {:<10}",
            rule.id,
            rule.name,
            rule.event_type_pattern,
            rule.enabled,
            rule.action.label()
        );
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("eventhub configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!("  Lock:     {}", cfg.lock_path().display());
    println!();
    println!("Server:");
    println!("  Bind: {}", cfg.bind);
    println!();
    println!("Limits:");
    println!("  Max chain hops:    {}", cfg.limits.max_chain_hops);
    println!("  Webhook timeout:   {}s", cfg.limits.webhook_timeout_seconds);
    println!("  Subscriber buffer: {}", cfg.limits.subscriber_buffer);
    println!();
    println!("Pipelines:");
    println!("  Stages:          {}", cfg.pipeline.stages.join(" -> "));
    println!("  Track patterns:  {}", cfg.pipeline.track_patterns.join(", "));
    println!("  Stall threshold: {}s", cfg.pipeline.stall_threshold_seconds);
    println!();
    println!("Scheduler:");
    println!("  Tick: {}s", cfg.scheduler.tick_interval().as_secs());

    Ok(())
}
