//! Pipeline state tracker.
//!
//! Turns the events of one job into an explicit stage machine:
//! - stages only move forward (or stay) unless a reset event arrives
//! - terminal stages accept nothing but resets
//! - each event is applied to a job at most once, in id order
//!
//! A periodic sweep flags pipelines that stopped progressing and emits one
//! `pipeline.stalled` event per stall onset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::catalog::Catalog;
use super::clock::Clock;
use super::feed::ConsumerFeed;
use super::ingest::Ingest;
use crate::config::PipelineSettings;
use crate::domain::pipeline::StageCount;
use crate::domain::{
    Event, NewEvent, Pipeline, PipelineDetail, PipelineStats, StageSet, Transition, TypePattern,
};
use crate::error::{HubError, HubResult};

/// Source of events produced by the tracker itself
pub const TRACKER_SOURCE: &str = "eventhub.tracker";
pub const STALLED_EVENT: &str = "pipeline.stalled";

/// Compiled tracker configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub stages: StageSet,
    pub track_patterns: Vec<TypePattern>,
    pub stage_map: HashMap<String, String>,
    pub reset_types: Vec<String>,
    pub stall_threshold: chrono::Duration,
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        // Built-in settings always compile
        Self::from_settings(&PipelineSettings::default()).unwrap_or_else(|_| Self {
            stages: StageSet::default(),
            track_patterns: Vec::new(),
            stage_map: HashMap::new(),
            reset_types: Vec::new(),
            stall_threshold: chrono::Duration::seconds(900),
            sweep_interval: Duration::from_secs(60),
        })
    }
}

impl TrackerConfig {
    pub fn from_settings(settings: &PipelineSettings) -> HubResult<Self> {
        let stages = StageSet::new(settings.stages.clone(), settings.terminal_stages.clone())?;
        let track_patterns = settings
            .track_patterns
            .iter()
            .map(|p| TypePattern::new(p))
            .collect::<HubResult<Vec<_>>>()?;
        for (event_type, stage) in &settings.stage_map {
            if stages.index_of(stage).is_none() {
                return Err(HubError::configuration(format!(
                    "stage_map entry '{}' names unknown stage '{}'",
                    event_type, stage
                )));
            }
        }

        let stall_threshold = i64::try_from(settings.stall_threshold_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| {
                HubError::configuration(format!(
                    "stall_threshold_seconds {} is out of range",
                    settings.stall_threshold_seconds
                ))
            })?;

        Ok(Self {
            stages,
            track_patterns,
            stage_map: settings.stage_map.clone(),
            reset_types: settings.reset_types.clone(),
            stall_threshold,
            sweep_interval: Duration::from_secs(settings.sweep_interval_seconds.max(1)),
        })
    }
}

/// What happened when an event was offered to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    /// No job id, or an event the tracker produced itself
    Untracked,
    /// Already applied (id at or below the job's last event)
    Duplicate,
    Created { stage: String },
    Advanced { from: String, to: String },
    /// Same stage again; clears a stall
    Refreshed { stage: String },
    Reset { from: String, to: String },
    Ignored { reason: &'static str },
}

impl std::fmt::Display for TrackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Untracked => write!(f, "untracked"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Created { stage } => write!(f, "created at {}", stage),
            Self::Advanced { from, to } => write!(f, "advanced {} -> {}", from, to),
            Self::Refreshed { stage } => write!(f, "refreshed at {}", stage),
            Self::Reset { from, to } => write!(f, "reset {} -> {}", from, to),
            Self::Ignored { reason } => write!(f, "ignored ({})", reason),
        }
    }
}

pub struct PipelineTracker {
    config: TrackerConfig,
    catalog: Arc<Catalog>,
    ingest: Arc<Ingest>,
    clock: Arc<dyn Clock>,
    pipelines: Mutex<HashMap<String, Pipeline>>,
}

impl PipelineTracker {
    /// Build the tracker, loading persisted pipelines
    pub fn new(
        config: TrackerConfig,
        catalog: Arc<Catalog>,
        ingest: Arc<Ingest>,
        clock: Arc<dyn Clock>,
    ) -> HubResult<Self> {
        let pipelines = catalog
            .list_pipelines()?
            .into_iter()
            .map(|p| (p.job_id.clone(), p))
            .collect::<HashMap<_, _>>();
        debug!(count = pipelines.len(), "Loaded pipelines");

        Ok(Self {
            config,
            catalog,
            ingest,
            clock,
            pipelines: Mutex::new(pipelines),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pipeline>> {
        self.pipelines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Whether the tracker follows this event type on its own feed
    pub fn tracks(&self, event: &Event) -> bool {
        self.config
            .track_patterns
            .iter()
            .any(|p| p.matches(&event.event_type))
    }

    /// Queue an event for this tracker's feed.
    ///
    /// The feed applies it in id order together with the events it tracks
    /// by pattern.
    pub fn request(&self, event: &Event) -> HubResult<()> {
        self.catalog.add_track_request(event.id)
    }

    fn stage_hint<'a>(&'a self, event: &'a Event) -> Option<&'a str> {
        match event.payload_field("stage") {
            Some(serde_json::Value::String(stage)) => Some(stage.as_str()),
            _ => self.config.stage_map.get(&event.event_type).map(String::as_str),
        }
    }

    /// Apply one event to its job's pipeline
    #[instrument(skip(self, event), fields(event_id = event.id, event_type = %event.event_type))]
    pub fn observe(&self, event: &Event) -> HubResult<TrackOutcome> {
        if event.source == TRACKER_SOURCE {
            return Ok(TrackOutcome::Untracked);
        }
        let Some(job_id) = event.job_id() else {
            return Ok(TrackOutcome::Untracked);
        };

        let hint = self.stage_hint(event);
        if let Some(stage) = hint {
            if self.config.stages.index_of(stage).is_none() {
                warn!(%job_id, stage, "Unknown stage, ignoring event");
                return Ok(TrackOutcome::Ignored {
                    reason: "unknown_stage",
                });
            }
        }
        let is_reset = self.config.reset_types.iter().any(|t| t == &event.event_type);

        let mut pipelines = self.lock();
        let Some(current) = pipelines.get(&job_id).cloned() else {
            let stage = hint.unwrap_or(self.config.stages.first()).to_string();
            let pipeline = Pipeline {
                job_id: job_id.clone(),
                stage: stage.clone(),
                last_transition_at: event.created_at,
                stalled: false,
                created_at: event.created_at,
                last_event_id: event.id,
            };
            let transition = Transition {
                job_id: job_id.clone(),
                from_stage: None,
                to_stage: stage.clone(),
                event_id: event.id,
                at: event.created_at,
                reset: false,
            };
            self.catalog.save_pipeline(&pipeline, Some(&transition))?;
            pipelines.insert(job_id.clone(), pipeline);
            info!(%job_id, %stage, "Pipeline created");
            return Ok(TrackOutcome::Created { stage });
        };

        if event.id <= current.last_event_id {
            return Ok(TrackOutcome::Duplicate);
        }

        let mut next = current.clone();
        next.last_event_id = event.id;

        let (outcome, transition) = if is_reset {
            let to = hint.unwrap_or(self.config.stages.first()).to_string();
            next.stage = to.clone();
            next.last_transition_at = event.created_at;
            next.stalled = false;
            (
                TrackOutcome::Reset {
                    from: current.stage.clone(),
                    to: to.clone(),
                },
                Some(self.transition(&job_id, &current.stage, &to, event, true)),
            )
        } else if self.config.stages.is_terminal(&current.stage) {
            (TrackOutcome::Ignored { reason: "terminal" }, None)
        } else {
            match hint {
                None => (
                    TrackOutcome::Ignored {
                        reason: "no_stage_hint",
                    },
                    None,
                ),
                Some(to) => {
                    let from_idx = self.config.stages.index_of(&current.stage);
                    let to_idx = self.config.stages.index_of(to);
                    if to_idx < from_idx {
                        debug!(%job_id, from = %current.stage, to, "Ignoring stage regression");
                        (
                            TrackOutcome::Ignored {
                                reason: "regression",
                            },
                            None,
                        )
                    } else {
                        next.stage = to.to_string();
                        next.last_transition_at = event.created_at;
                        next.stalled = false;
                        if to == current.stage {
                            (
                                TrackOutcome::Refreshed {
                                    stage: to.to_string(),
                                },
                                None,
                            )
                        } else {
                            (
                                TrackOutcome::Advanced {
                                    from: current.stage.clone(),
                                    to: to.to_string(),
                                },
                                Some(self.transition(&job_id, &current.stage, to, event, false)),
                            )
                        }
                    }
                }
            }
        };

        self.catalog.save_pipeline(&next, transition.as_ref())?;
        pipelines.insert(job_id.clone(), next);

        match &outcome {
            TrackOutcome::Advanced { from, to } => info!(%job_id, %from, %to, "Pipeline advanced"),
            TrackOutcome::Reset { from, to } => info!(%job_id, %from, %to, "Pipeline reset"),
            other => debug!(%job_id, outcome = ?other, "Pipeline event applied"),
        }
        Ok(outcome)
    }

    fn transition(&self, job_id: &str, from: &str, to: &str, event: &Event, reset: bool) -> Transition {
        Transition {
            job_id: job_id.to_string(),
            from_stage: Some(from.to_string()),
            to_stage: to.to_string(),
            event_id: event.id,
            at: event.created_at,
            reset,
        }
    }

    /// Flag stalled pipelines and emit one event per stall onset.
    ///
    /// Returns the emitted events. A pipeline whose event cannot be
    /// appended is left unflagged so the next sweep tries again.
    pub fn sweep(&self, now: DateTime<Utc>) -> HubResult<Vec<Event>> {
        Ok(self.sweep_with(now, |new| self.ingest.append(new).map(|a| a.event)))
    }

    fn sweep_with<F>(&self, now: DateTime<Utc>, mut emit: F) -> Vec<Event>
    where
        F: FnMut(NewEvent) -> HubResult<Event>,
    {
        let candidates: Vec<String> = self
            .lock()
            .values()
            .filter(|p| self.is_stalled(p, now))
            .map(|p| p.job_id.clone())
            .collect();

        let mut emitted = Vec::with_capacity(candidates.len());
        for job_id in candidates {
            match self.announce_stall(&job_id, now, &mut emit) {
                Ok(Some(event)) => emitted.push(event),
                Ok(None) => {}
                Err(e) => warn!(%job_id, error = %e, "Failed to report stalled pipeline"),
            }
        }
        emitted
    }

    fn is_stalled(&self, pipeline: &Pipeline, now: DateTime<Utc>) -> bool {
        !pipeline.stalled
            && !self.config.stages.is_terminal(&pipeline.stage)
            && now - pipeline.last_transition_at > self.config.stall_threshold
    }

    fn announce_stall<F>(&self, job_id: &str, now: DateTime<Utc>, emit: &mut F) -> HubResult<Option<Event>>
    where
        F: FnMut(NewEvent) -> HubResult<Event>,
    {
        let flagged = {
            let mut pipelines = self.lock();
            let Some(pipeline) = pipelines.get_mut(job_id) else {
                return Ok(None);
            };
            // Progress may have arrived since the candidates were collected
            if !self.is_stalled(pipeline, now) {
                return Ok(None);
            }
            let mut flagged = pipeline.clone();
            flagged.stalled = true;
            self.catalog.save_pipeline(&flagged, None)?;
            *pipeline = flagged.clone();
            flagged
        };

        let idle = now - flagged.last_transition_at;
        warn!(%job_id, stage = %flagged.stage, stalled_seconds = idle.num_seconds(), "Pipeline stalled");
        let appended = emit(NewEvent::new(
            STALLED_EVENT,
            TRACKER_SOURCE,
            json!({
                "job_id": job_id,
                "stage": flagged.stage,
                "stalled_seconds": idle.num_seconds(),
            }),
        ));
        match appended {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                self.unflag(&flagged);
                Err(e)
            }
        }
    }

    /// Undo a stall flag whose event never made it out
    fn unflag(&self, flagged: &Pipeline) {
        let mut pipelines = self.lock();
        let Some(pipeline) = pipelines.get_mut(&flagged.job_id) else {
            return;
        };
        if !pipeline.stalled || pipeline.last_event_id != flagged.last_event_id {
            return;
        }
        pipeline.stalled = false;
        if let Err(e) = self.catalog.save_pipeline(pipeline, None) {
            warn!(job_id = %flagged.job_id, error = %e, "Failed to clear stall flag");
        }
    }

    /// All pipelines, most recently moved first
    pub fn list(&self) -> Vec<Pipeline> {
        let mut pipelines: Vec<Pipeline> = self.lock().values().cloned().collect();
        pipelines.sort_by(|a, b| {
            b.last_transition_at
                .cmp(&a.last_transition_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        pipelines
    }

    pub fn get(&self, job_id: &str) -> Option<Pipeline> {
        self.lock().get(job_id).cloned()
    }

    /// Pipeline with its transition history
    pub fn detail(&self, job_id: &str) -> HubResult<PipelineDetail> {
        let pipeline = self
            .get(job_id)
            .ok_or_else(|| HubError::not_found("pipeline", job_id))?;
        let transitions = self.catalog.list_transitions(job_id)?;
        Ok(PipelineDetail {
            pipeline,
            transitions,
        })
    }

    pub fn stats(&self) -> PipelineStats {
        let pipelines = self.lock();
        let mut by_stage: Vec<StageCount> = self
            .config
            .stages
            .stages()
            .iter()
            .map(|stage| StageCount {
                stage: stage.clone(),
                count: 0,
            })
            .collect();

        let mut stats = PipelineStats {
            total: pipelines.len(),
            ..Default::default()
        };
        for pipeline in pipelines.values() {
            if pipeline.stalled {
                stats.stalled += 1;
            }
            if self.config.stages.is_terminal(&pipeline.stage) {
                stats.terminal += 1;
            }
            if let Some(entry) = by_stage.iter_mut().find(|c| c.stage == pipeline.stage) {
                entry.count += 1;
            }
        }
        stats.by_stage = by_stage;
        stats
    }

    /// Follow the tracker's own feed until shutdown.
    ///
    /// An event is taken only once the rule engine has finished it, so any
    /// `pipeline_track` request for it is already queued.
    pub async fn run_feed(
        self: Arc<Self>,
        mut feed: ConsumerFeed,
        mut rules_progress: watch::Receiver<i64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(cursor = feed.cursor(), "Pipeline tracker started");
        'feed: while let Some(batch) = feed.next_batch(&mut shutdown).await {
            for event in batch {
                let caught_up = tokio::select! {
                    reached = rules_progress.wait_for(|done| *done >= event.id) => reached.is_ok(),
                    _ = shutdown.wait_for(|stop| *stop) => false,
                };
                if !caught_up {
                    break 'feed;
                }

                let requested = self.catalog.take_track_request(event.id).unwrap_or_else(|e| {
                    warn!(event_id = event.id, error = %e, "Failed to read tracking requests");
                    false
                });
                if requested || self.tracks(&event) {
                    if let Err(e) = self.observe(&event) {
                        warn!(event_id = event.id, error = %e, "Pipeline tracking failed");
                    }
                }
                feed.commit(event.id);
            }
        }
        info!("Pipeline tracker stopped");
    }

    /// Run the stall sweep every `sweep_interval` until shutdown
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(self.clock.now()) {
                        warn!(error = %e, "Stall sweep failed");
                    }
                }
            }
        }
        debug!("Stall sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::dispatcher::Dispatcher;
    use crate::core::event_store::EventStore;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        clock: Arc<ManualClock>,
        ingest: Arc<Ingest>,
        tracker: PipelineTracker,
    }

    fn fixture(settings: PipelineSettings) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(EventStore::open_in_memory_with_clock(clock.clone()).unwrap());
        let ingest = Arc::new(Ingest::new(store, Arc::new(Dispatcher::new(16))));
        let tracker = PipelineTracker::new(
            TrackerConfig::from_settings(&settings).unwrap(),
            Arc::new(Catalog::open_in_memory().unwrap()),
            ingest.clone(),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            clock,
            ingest,
            tracker,
        }
    }

    fn emit(f: &Fixture, event_type: &str, payload: serde_json::Value) -> Event {
        f.ingest
            .append(NewEvent::new(event_type, "dojo", payload))
            .unwrap()
            .event
    }

    #[test]
    fn test_stage_never_regresses() {
        let f = fixture(PipelineSettings::default());
        for stage in ["pending", "tts", "avatar", "tts"] {
            let event = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": stage}));
            f.tracker.observe(&event).unwrap();
        }
        assert_eq!(f.tracker.get("j1").unwrap().stage, "avatar");
        let detail = f.tracker.detail("j1").unwrap();
        let stages: Vec<&str> = detail.transitions.iter().map(|t| t.to_stage.as_str()).collect();
        assert_eq!(stages, vec!["pending", "tts", "avatar"]);
    }

    #[test]
    fn test_stage_map_and_numeric_job_id() {
        let mut settings = PipelineSettings::default();
        settings
            .stage_map
            .insert("dojo.tts_done".to_string(), "tts".to_string());
        let f = fixture(settings);

        let event = emit(&f, "dojo.tts_done", json!({"job_id": 17}));
        assert_eq!(
            f.tracker.observe(&event).unwrap(),
            TrackOutcome::Created {
                stage: "tts".to_string()
            }
        );
        assert!(f.tracker.get("17").is_some());
    }

    #[test]
    fn test_event_applied_once() {
        let f = fixture(PipelineSettings::default());
        let first = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": "tts"}));
        f.tracker.observe(&first).unwrap();
        assert_eq!(f.tracker.observe(&first).unwrap(), TrackOutcome::Duplicate);
    }

    #[test]
    fn test_reset_and_terminal() {
        let f = fixture(PipelineSettings::default());
        let up = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": "uploaded"}));
        f.tracker.observe(&up).unwrap();

        let late = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": "uploaded"}));
        assert_eq!(
            f.tracker.observe(&late).unwrap(),
            TrackOutcome::Ignored { reason: "terminal" }
        );

        let reset = emit(&f, "pipeline.reset", json!({"job_id": "j1"}));
        assert_eq!(
            f.tracker.observe(&reset).unwrap(),
            TrackOutcome::Reset {
                from: "uploaded".to_string(),
                to: "pending".to_string()
            }
        );
        assert!(f.tracker.detail("j1").unwrap().transitions[1].reset);
    }

    #[test]
    fn test_unknown_stage_and_untracked() {
        let f = fixture(PipelineSettings::default());
        let bogus = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": "mastering"}));
        assert_eq!(
            f.tracker.observe(&bogus).unwrap(),
            TrackOutcome::Ignored {
                reason: "unknown_stage"
            }
        );
        let no_job = emit(&f, "pipeline.stage", json!({"stage": "tts"}));
        assert_eq!(f.tracker.observe(&no_job).unwrap(), TrackOutcome::Untracked);
        assert!(f.tracker.list().is_empty());
    }

    #[test]
    fn test_stall_detected_once_per_onset() {
        let f = fixture(PipelineSettings::default());
        let event = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": "tts"}));
        f.tracker.observe(&event).unwrap();

        f.clock.advance(ChronoDuration::seconds(901));
        let emitted = f.tracker.sweep(f.clock.now()).unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event_type, STALLED_EVENT);
        assert_eq!(emitted[0].source, TRACKER_SOURCE);
        assert_eq!(emitted[0].payload["job_id"], "j1");
        assert_eq!(emitted[0].payload["stage"], "tts");
        assert!(f.tracker.get("j1").unwrap().stalled);

        // The tracker ignores its own stalled event
        assert_eq!(f.tracker.observe(&emitted[0]).unwrap(), TrackOutcome::Untracked);

        f.clock.advance(ChronoDuration::seconds(60));
        assert!(f.tracker.sweep(f.clock.now()).unwrap().is_empty());

        // Progress clears the stall; a new onset emits again
        let next = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": "avatar"}));
        f.tracker.observe(&next).unwrap();
        assert!(!f.tracker.get("j1").unwrap().stalled);
        f.clock.advance(ChronoDuration::seconds(901));
        assert_eq!(f.tracker.sweep(f.clock.now()).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_stall_report_is_retried() {
        let f = fixture(PipelineSettings::default());
        for job in ["a", "b"] {
            let event = emit(&f, "pipeline.stage", json!({"job_id": job, "stage": "tts"}));
            f.tracker.observe(&event).unwrap();
        }
        f.clock.advance(ChronoDuration::seconds(901));

        // The first report fails, the second goes through
        let mut calls = 0;
        let emitted = f.tracker.sweep_with(f.clock.now(), |new| {
            calls += 1;
            if calls == 1 {
                Err(HubError::configuration("store unavailable"))
            } else {
                f.ingest.append(new).map(|a| a.event)
            }
        });
        assert_eq!(emitted.len(), 1);
        let reported = emitted[0].payload["job_id"].as_str().unwrap().to_string();
        let missed = if reported == "a" { "b" } else { "a" };
        assert!(f.tracker.get(&reported).unwrap().stalled);
        assert!(!f.tracker.get(missed).unwrap().stalled);

        let retried = f.tracker.sweep(f.clock.now()).unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].payload["job_id"], missed);
        assert!(f.tracker.sweep(f.clock.now()).unwrap().is_empty());
    }

    #[test]
    fn test_stall_threshold_out_of_range() {
        let mut settings = PipelineSettings::default();
        settings.stall_threshold_seconds = u64::MAX;
        assert!(matches!(
            TrackerConfig::from_settings(&settings),
            Err(HubError::Configuration(_))
        ));
        settings.stall_threshold_seconds = i64::MAX as u64;
        assert!(TrackerConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn test_terminal_pipelines_never_stall() {
        let f = fixture(PipelineSettings::default());
        let event = emit(&f, "pipeline.stage", json!({"job_id": "j1", "stage": "uploaded"}));
        f.tracker.observe(&event).unwrap();
        f.clock.advance(ChronoDuration::hours(2));
        assert!(f.tracker.sweep(f.clock.now()).unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let f = fixture(PipelineSettings::default());
        for (job, stage) in [("a", "tts"), ("b", "tts"), ("c", "uploaded")] {
            let event = emit(&f, "pipeline.stage", json!({"job_id": job, "stage": stage}));
            f.tracker.observe(&event).unwrap();
        }
        let stats = f.tracker.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.terminal, 1);
        assert_eq!(stats.by_stage[1].stage, "tts");
        assert_eq!(stats.by_stage[1].count, 2);
    }

    #[test]
    fn test_bad_stage_map_rejected() {
        let mut settings = PipelineSettings::default();
        settings
            .stage_map
            .insert("x.y".to_string(), "nowhere".to_string());
        assert!(TrackerConfig::from_settings(&settings).is_err());
    }
}
