//! External status collaborators for the resume snapshot.
//!
//! Deployment outcomes and freeform context live outside the hub. The
//! shipped providers read files written by deploy scripts and by hand.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last deployment outcome for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployStatus {
    pub service: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[async_trait]
pub trait DeployStatusProvider: Send + Sync {
    async fn deploy_statuses(&self) -> Result<Vec<DeployStatus>>;
}

#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn context(&self) -> Result<String>;
}

/// Reads a JSON array of `DeployStatus` from a file
pub struct FileDeployStatusProvider {
    path: PathBuf,
}

impl FileDeployStatusProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeployStatusProvider for FileDeployStatusProvider {
    async fn deploy_statuses(&self) -> Result<Vec<DeployStatus>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read deploy status file {:?}", self.path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid deploy status file {:?}", self.path))
    }
}

/// Reads freeform context text from a file
pub struct FileContextProvider {
    path: PathBuf,
}

impl FileContextProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ContextProvider for FileContextProvider {
    async fn context(&self) -> Result<String> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read context file {:?}", self.path))?;
        Ok(text.trim_end().to_string())
    }
}
