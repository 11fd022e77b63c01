//! Wiring of the hub's components and background tasks.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use super::catalog::Catalog;
use super::clock::{Clock, SystemClock};
use super::dispatcher::Dispatcher;
use super::event_store::EventStore;
use super::executor::ActionExecutor;
use super::feed::ConsumerFeed;
use super::ingest::Ingest;
use super::limits::HubLimits;
use super::matcher::RuleEngine;
use super::resume::ResumeAggregator;
use super::scheduler::Scheduler;
use super::tracker::{PipelineTracker, TrackerConfig};
use crate::adapters::status::{FileContextProvider, FileDeployStatusProvider};
use crate::adapters::webhook::{HttpWebhookSender, WebhookSender};
use crate::config::{ResolvedConfig, ResumeSettings};
use crate::domain::Event;
use crate::error::{HubError, HubResult};

/// Consumer names; also the keys of persisted cursors
pub const RULES_CONSUMER: &str = "rules";
pub const TRACKER_CONSUMER: &str = "tracker";

/// Everything needed to assemble a hub
pub struct HubOptions {
    pub limits: HubLimits,
    pub tracker: TrackerConfig,
    pub scheduler_tick: Duration,
    pub resume: ResumeSettings,
    pub webhook: Arc<dyn WebhookSender>,
    pub clock: Arc<dyn Clock>,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            limits: HubLimits::default(),
            tracker: TrackerConfig::default(),
            scheduler_tick: Duration::from_secs(30),
            resume: ResumeSettings::default(),
            webhook: Arc::new(HttpWebhookSender::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

impl HubOptions {
    pub fn from_config(config: &ResolvedConfig) -> HubResult<Self> {
        Ok(Self {
            limits: config.limits.clone(),
            tracker: TrackerConfig::from_settings(&config.pipeline)?,
            scheduler_tick: config.scheduler.tick_interval(),
            resume: config.resume.clone(),
            ..Default::default()
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookSender>) -> Self {
        self.webhook = webhook;
        self
    }
}

struct PendingFeeds {
    rules: mpsc::Receiver<Event>,
    tracker: mpsc::Receiver<Event>,
}

/// The assembled hub. Construct once, share behind `Arc`, then `start`.
pub struct Hub {
    pub store: Arc<EventStore>,
    pub catalog: Arc<Catalog>,
    pub dispatcher: Arc<Dispatcher>,
    pub ingest: Arc<Ingest>,
    pub tracker: Arc<PipelineTracker>,
    pub scheduler: Arc<Scheduler>,
    pub resume: Arc<ResumeAggregator>,
    pub engine: Arc<RuleEngine>,
    pub clock: Arc<dyn Clock>,
    pub limits: HubLimits,
    pending: Mutex<Option<PendingFeeds>>,
}

impl Hub {
    /// Open a hub over one SQLite database file
    pub fn open(database: &Path, options: HubOptions) -> HubResult<Self> {
        let store = EventStore::open(database, options.clock.clone())?;
        let catalog = Catalog::open(database)?;
        Self::assemble(store, catalog, options)
    }

    /// Hub backed by in-memory databases
    pub fn in_memory(options: HubOptions) -> HubResult<Self> {
        let store = EventStore::open_in_memory_with_clock(options.clock.clone())?;
        let catalog = Catalog::open_in_memory()?;
        Self::assemble(store, catalog, options)
    }

    fn assemble(store: EventStore, catalog: Catalog, options: HubOptions) -> HubResult<Self> {
        let store = Arc::new(store);
        let catalog = Arc::new(catalog);
        let dispatcher = Arc::new(Dispatcher::new(options.limits.subscriber_buffer));

        let mut ingest = Ingest::new(store.clone(), dispatcher.clone());
        let pending = PendingFeeds {
            rules: ingest.add_consumer(RULES_CONSUMER, options.limits.consumer_buffer),
            tracker: ingest.add_consumer(TRACKER_CONSUMER, options.limits.consumer_buffer),
        };
        let ingest = Arc::new(ingest);

        let tracker = Arc::new(PipelineTracker::new(
            options.tracker,
            catalog.clone(),
            ingest.clone(),
            options.clock.clone(),
        )?);

        let mut resume = ResumeAggregator::new(
            store.clone(),
            catalog.clone(),
            tracker.clone(),
            options.webhook.clone(),
            options.clock.clone(),
        )
        .with_recent_events(options.resume.recent_events)
        .with_webhook_timeout(options.limits.webhook_timeout());
        if let Some(path) = &options.resume.deploy_status_file {
            resume = resume.with_deploy_provider(Arc::new(FileDeployStatusProvider::new(path)));
        }
        if let Some(path) = &options.resume.context_file {
            resume = resume.with_context_provider(Arc::new(FileContextProvider::new(path)));
        }
        let resume = Arc::new(resume);

        let executor = Arc::new(ActionExecutor::new(
            catalog.clone(),
            ingest.clone(),
            tracker.clone(),
            resume.clone(),
            options.webhook,
            options.clock.clone(),
            options.limits.clone(),
        ));
        let engine = Arc::new(RuleEngine::new(catalog.clone(), executor));
        let scheduler = Arc::new(Scheduler::new(
            catalog.clone(),
            ingest.clone(),
            options.clock.clone(),
            options.scheduler_tick,
        ));

        Ok(Self {
            store,
            catalog,
            dispatcher,
            ingest,
            tracker,
            scheduler,
            resume,
            engine,
            clock: options.clock,
            limits: options.limits,
            pending: Mutex::new(Some(pending)),
        })
    }

    /// Spawn the rule engine, tracker feed, stall sweeper and scheduler.
    ///
    /// Consumer feeds resume from their persisted cursors. Can only be
    /// called once.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> HubResult<Vec<JoinHandle<()>>> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| HubError::configuration("hub already started"))?;

        let catchup = self.limits.catchup_interval();
        let rules_feed = ConsumerFeed::open(RULES_CONSUMER, self.store.clone(), pending.rules, catchup)?;
        let tracker_feed =
            ConsumerFeed::open(TRACKER_CONSUMER, self.store.clone(), pending.tracker, catchup)?;

        let handles = vec![
            tokio::spawn(self.engine.clone().run(rules_feed, shutdown.clone())),
            tokio::spawn(self.tracker.clone().run_feed(
                tracker_feed,
                self.engine.progress(),
                shutdown.clone(),
            )),
            tokio::spawn(self.tracker.clone().run_sweeper(shutdown.clone())),
            tokio::spawn(self.scheduler.clone().run(shutdown)),
        ];
        info!("Hub background tasks started");
        Ok(handles)
    }
}
