//! Resume snapshot: a composite "where are we" view for humans and agents.
//!
//! Combines recent events, pipeline state and external deploy/context
//! status, and pushes the result to configured targets.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::catalog::Catalog;
use super::clock::Clock;
use super::event_store::{EventQuery, EventStore};
use super::tracker::PipelineTracker;
use crate::adapters::status::{ContextProvider, DeployStatus, DeployStatusProvider};
use crate::adapters::webhook::WebhookSender;
use crate::domain::{Event, Pipeline, PipelineStats, PushTarget, PushTargetType};
use crate::error::HubResult;

/// Value from an external provider, or the reason it is missing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ProviderStatus<T> {
    fn from_result(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Self {
                value: Some(value),
                error: None,
            },
            Err(e) => Self {
                value: None,
                error: Some(format!("{:#}", e)),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalStatus {
    /// `None` when no provider is configured
    pub deploys: Option<ProviderStatus<Vec<DeployStatus>>>,
    pub context: Option<ProviderStatus<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeSnapshot {
    pub generated_at: DateTime<Utc>,
    /// Newest first
    pub recent_events: Vec<Event>,
    pub pipelines: Vec<Pipeline>,
    pub stats: PipelineStats,
    pub external_status: ExternalStatus,
}

/// Result of pushing to one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushOutcome {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: PushTargetType,
    pub destination: String,
    pub success: bool,
    pub detail: String,
}

pub struct ResumeAggregator {
    store: Arc<EventStore>,
    catalog: Arc<Catalog>,
    tracker: Arc<PipelineTracker>,
    webhook: Arc<dyn WebhookSender>,
    clock: Arc<dyn Clock>,
    deploys: Option<Arc<dyn DeployStatusProvider>>,
    context: Option<Arc<dyn ContextProvider>>,
    recent_events: usize,
    webhook_timeout: Duration,
}

impl ResumeAggregator {
    pub fn new(
        store: Arc<EventStore>,
        catalog: Arc<Catalog>,
        tracker: Arc<PipelineTracker>,
        webhook: Arc<dyn WebhookSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            tracker,
            webhook,
            clock,
            deploys: None,
            context: None,
            recent_events: 50,
            webhook_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_deploy_provider(mut self, provider: Arc<dyn DeployStatusProvider>) -> Self {
        self.deploys = Some(provider);
        self
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    pub fn with_recent_events(mut self, limit: usize) -> Self {
        self.recent_events = limit;
        self
    }

    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    /// Assemble a snapshot; provider failures are reported inline
    pub async fn build_snapshot(&self) -> HubResult<ResumeSnapshot> {
        let recent_events = self.store.query(&EventQuery {
            limit: Some(self.recent_events),
            ..Default::default()
        })?;

        let deploys = match &self.deploys {
            Some(provider) => Some(ProviderStatus::from_result(provider.deploy_statuses().await)),
            None => None,
        };
        let context = match &self.context {
            Some(provider) => Some(ProviderStatus::from_result(provider.context().await)),
            None => None,
        };

        Ok(ResumeSnapshot {
            generated_at: self.clock.now(),
            recent_events,
            pipelines: self.tracker.list(),
            stats: self.tracker.stats(),
            external_status: ExternalStatus { deploys, context },
        })
    }

    /// Push a snapshot to each target, attempting every one
    #[instrument(skip(self, snapshot, targets), fields(targets = targets.len()))]
    pub async fn push(&self, snapshot: &ResumeSnapshot, targets: &[PushTarget]) -> Vec<PushOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            let result = match target.target_type {
                PushTargetType::File => write_atomically(Path::new(&target.destination), snapshot)
                    .map(|bytes| format!("wrote {} bytes", bytes)),
                PushTargetType::Webhook => match serde_json::to_value(snapshot) {
                    Ok(body) => self
                        .webhook
                        .post(&target.destination, &body, self.webhook_timeout)
                        .await
                        .map(|r| format!("HTTP {}", r.status)),
                    Err(e) => Err(e.into()),
                },
            };

            let outcome = match result {
                Ok(detail) => PushOutcome {
                    target_id: target.id.clone(),
                    target_type: target.target_type,
                    destination: target.destination.clone(),
                    success: true,
                    detail,
                },
                Err(e) => {
                    warn!(target_id = %target.id, error = %e, "Resume push failed");
                    PushOutcome {
                        target_id: target.id.clone(),
                        target_type: target.target_type,
                        destination: target.destination.clone(),
                        success: false,
                        detail: format!("{:#}", e),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(pushed = outcomes.len() - failed, failed, "Resume push finished");
        outcomes
    }

    /// Build a fresh snapshot and push it to every enabled target
    pub async fn push_all(&self) -> HubResult<(ResumeSnapshot, Vec<PushOutcome>)> {
        let snapshot = self.build_snapshot().await?;
        let targets = self.catalog.enabled_push_targets()?;
        let outcomes = self.push(&snapshot, &targets).await;
        Ok((snapshot, outcomes))
    }
}

/// Write JSON to a temp file beside `dest`, then rename over it
fn write_atomically(dest: &Path, snapshot: &ResumeSnapshot) -> anyhow::Result<usize> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let body = serde_json::to_vec_pretty(snapshot)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(body.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::status::{FileContextProvider, FileDeployStatusProvider};
    use crate::adapters::webhook::RecordingWebhookSender;
    use crate::core::clock::SystemClock;
    use crate::core::dispatcher::Dispatcher;
    use crate::core::ingest::Ingest;
    use crate::core::tracker::TrackerConfig;
    use crate::domain::{NewEvent, PushTargetSpec};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        ingest: Arc<Ingest>,
        catalog: Arc<Catalog>,
        tracker: Arc<PipelineTracker>,
        webhook: Arc<RecordingWebhookSender>,
    }

    fn fixture(failing: Vec<String>) -> Fixture {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let ingest = Arc::new(Ingest::new(store, Arc::new(Dispatcher::new(8))));
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let tracker = Arc::new(
            PipelineTracker::new(
                TrackerConfig::default(),
                catalog.clone(),
                ingest.clone(),
                Arc::new(SystemClock),
            )
            .unwrap(),
        );
        Fixture {
            ingest,
            catalog,
            tracker,
            webhook: Arc::new(RecordingWebhookSender::failing(failing)),
        }
    }

    fn aggregator(f: &Fixture) -> ResumeAggregator {
        ResumeAggregator::new(
            f.ingest.store().clone(),
            f.catalog.clone(),
            f.tracker.clone(),
            f.webhook.clone(),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_snapshot_contents() {
        let f = fixture(vec![]);
        let event = f
            .ingest
            .append(NewEvent::new("pipeline.stage", "dojo", json!({"job_id": "j1", "stage": "tts"})))
            .unwrap()
            .event;
        f.tracker.observe(&event).unwrap();

        let dir = TempDir::new().unwrap();
        let context = dir.path().join("context.md");
        std::fs::write(&context, "Focus: tracker").unwrap();

        let snapshot = aggregator(&f)
            .with_context_provider(Arc::new(FileContextProvider::new(&context)))
            .with_deploy_provider(Arc::new(FileDeployStatusProvider::new(dir.path().join("missing.json"))))
            .build_snapshot()
            .await
            .unwrap();

        assert_eq!(snapshot.recent_events.len(), 1);
        assert_eq!(snapshot.pipelines[0].job_id, "j1");
        assert_eq!(snapshot.stats.total, 1);
        let ctx = snapshot.external_status.context.unwrap();
        assert_eq!(ctx.value.as_deref(), Some("Focus: tracker"));
        let deploys = snapshot.external_status.deploys.unwrap();
        assert!(deploys.value.is_none());
        assert!(deploys.error.is_some());
    }

    #[tokio::test]
    async fn test_push_to_file_and_webhooks() {
        let f = fixture(vec!["http://down.local/resume".to_string()]);
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out").join("resume.json");

        for (kind, destination) in [
            (PushTargetType::File, dest.to_string_lossy().to_string()),
            (PushTargetType::Webhook, "http://up.local/resume".to_string()),
            (PushTargetType::Webhook, "http://down.local/resume".to_string()),
        ] {
            let target = PushTargetSpec {
                target_type: kind,
                destination,
                enabled: true,
            }
            .into_target(uuid::Uuid::new_v4().to_string(), Utc::now())
            .unwrap();
            f.catalog.insert_push_target(&target).unwrap();
        }

        let (_, outcomes) = aggregator(&f).push_all().await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(outcomes[1].success);
        assert!(!outcomes[2].success);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&dest).unwrap()).unwrap();
        assert!(written.get("generated_at").is_some());
        assert_eq!(f.webhook.requests().len(), 2);
    }
}
