//! Configuration for the hub.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (EVENTHUB_HOME, EVENTHUB_DB, EVENTHUB_BIND)
//! 2. Config file (.eventhub/config.yaml)
//! 3. Defaults (~/.eventhub)
//!
//! Config file discovery:
//! - Searches current directory and parents for .eventhub/config.yaml
//! - `paths.home` is relative to the .eventhub/ directory; other paths are
//!   relative to the project root (the parent of .eventhub/)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::limits::HubLimits;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: HubLimits,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub resume: ResumeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Hub state directory (relative to .eventhub/)
    pub home: Option<String>,
    /// SQLite database file (relative to the project root)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeConfig {
    pub recent_events: Option<usize>,
    pub deploy_status_file: Option<String>,
    pub context_file: Option<String>,
}

/// Pipeline tracker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Ordered stage names
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,

    /// Stages that accept nothing but resets (default: the last stage)
    #[serde(default)]
    pub terminal_stages: Vec<String>,

    /// Event type patterns the tracker follows
    #[serde(default = "default_track_patterns")]
    pub track_patterns: Vec<String>,

    /// Stage implied by an event type when the payload has no `stage`
    #[serde(default)]
    pub stage_map: HashMap<String, String>,

    /// Event types allowed to move a pipeline backwards
    #[serde(default = "default_reset_types")]
    pub reset_types: Vec<String>,

    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_seconds: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_stages() -> Vec<String> {
    crate::domain::pipeline::DEFAULT_STAGES
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_track_patterns() -> Vec<String> {
    vec!["pipeline.*".to_string(), "dojo.*".to_string()]
}
fn default_reset_types() -> Vec<String> {
    vec!["pipeline.reset".to_string()]
}
fn default_stall_threshold() -> u64 {
    900
} // 15 min
fn default_sweep_interval() -> u64 {
    60
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            terminal_stages: Vec::new(),
            track_patterns: default_track_patterns(),
            stage_map: HashMap::new(),
            reset_types: default_reset_types(),
            stall_threshold_seconds: default_stall_threshold(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Seconds between ticks; must stay under a minute
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

fn default_tick_seconds() -> u64 {
    30
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.clamp(1, 59))
    }
}

/// Resume aggregator settings with resolved paths
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeSettings {
    pub recent_events: usize,
    pub deploy_status_file: Option<PathBuf>,
    pub context_file: Option<PathBuf>,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            recent_events: 50,
            deploy_status_file: None,
            context_file: None,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Hub state directory (lock file, default database)
    pub home: PathBuf,
    /// SQLite database holding events and administrative tables
    pub database: PathBuf,
    /// HTTP listen address
    pub bind: String,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub limits: HubLimits,
    pub pipeline: PipelineSettings,
    pub scheduler: SchedulerSettings,
    pub resume: ResumeSettings,
}

impl ResolvedConfig {
    /// Lock file guarding against two servers on one database
    pub fn lock_path(&self) -> PathBuf {
        self.home.join("eventhub.lock")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".eventhub").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    build_config(find_config_file(), |key| std::env::var(key).ok())
}

/// Merge an optional config file with environment overrides
fn build_config(
    config_file: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".eventhub");

    let Some(config_path) = config_file else {
        let home = env("EVENTHUB_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);
        let database = env("EVENTHUB_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("eventhub.db"));

        return Ok(ResolvedConfig {
            home,
            database,
            bind: env("EVENTHUB_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            config_file: None,
            limits: HubLimits::default(),
            pipeline: PipelineSettings::default(),
            scheduler: SchedulerSettings::default(),
            resume: ResumeSettings::default(),
        });
    };

    let config = load_config_file(&config_path)?;

    // .eventhub/ and the project root above it
    let hub_dir = config_path.parent().unwrap_or(Path::new("."));
    let base_dir = hub_dir.parent().unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env("EVENTHUB_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = config.paths.home {
        resolve_path(hub_dir, home_path)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env("EVENTHUB_DB") {
        PathBuf::from(env_db)
    } else if let Some(ref db_path) = config.paths.database {
        resolve_path(base_dir, db_path)
    } else {
        home.join("eventhub.db")
    };

    let bind = env("EVENTHUB_BIND")
        .or(config.server.bind)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());

    let resume = ResumeSettings {
        recent_events: config.resume.recent_events.unwrap_or(50),
        deploy_status_file: config
            .resume
            .deploy_status_file
            .as_deref()
            .map(|p| resolve_path(base_dir, p)),
        context_file: config
            .resume
            .context_file
            .as_deref()
            .map(|p| resolve_path(base_dir, p)),
    };

    Ok(ResolvedConfig {
        home,
        database,
        bind,
        config_file: Some(config_path),
        limits: config.limits,
        pipeline: config.pipeline,
        scheduler: config.scheduler,
        resume,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
