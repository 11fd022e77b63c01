//! Pipeline Tracker Integration Tests

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use eventhub::adapters::RecordingWebhookSender;
use eventhub::core::{Clock, EventQuery, Hub, HubOptions, ManualClock, TrackOutcome};
use eventhub::domain::{Event, NewEvent};
use serde_json::{json, Value};
use tempfile::TempDir;

fn options(clock: Arc<ManualClock>) -> HubOptions {
    HubOptions::default()
        .with_clock(clock)
        .with_webhook(Arc::new(RecordingWebhookSender::new()))
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()))
}

fn stage_event(hub: &Hub, job_id: &str, stage: &str) -> Event {
    append(hub, "pipeline.stage", json!({"job_id": job_id, "stage": stage}))
}

fn append(hub: &Hub, event_type: &str, payload: Value) -> Event {
    hub.ingest
        .append(NewEvent::new(event_type, "dojo", payload))
        .unwrap()
        .event
}

#[tokio::test]
async fn test_stage_never_regresses() {
    let hub = Hub::in_memory(options(clock())).unwrap();

    let e = stage_event(&hub, "j1", "pending");
    assert_eq!(
        hub.tracker.observe(&e).unwrap(),
        TrackOutcome::Created {
            stage: "pending".to_string()
        }
    );
    for stage in ["tts", "avatar"] {
        let e = stage_event(&hub, "j1", stage);
        assert!(matches!(
            hub.tracker.observe(&e).unwrap(),
            TrackOutcome::Advanced { .. }
        ));
    }

    let e = stage_event(&hub, "j1", "tts");
    assert_eq!(
        hub.tracker.observe(&e).unwrap(),
        TrackOutcome::Ignored {
            reason: "regression"
        }
    );
    assert_eq!(hub.tracker.get("j1").unwrap().stage, "avatar");

    let detail = hub.tracker.detail("j1").unwrap();
    let stages: Vec<&str> = detail.transitions.iter().map(|t| t.to_stage.as_str()).collect();
    assert_eq!(stages, vec!["pending", "tts", "avatar"]);
}

#[tokio::test]
async fn test_stall_reported_once_per_onset() {
    let clock = clock();
    let hub = Hub::in_memory(options(clock.clone())).unwrap();
    let threshold = hub.tracker.config().stall_threshold;

    let e = stage_event(&hub, "j1", "tts");
    hub.tracker.observe(&e).unwrap();

    clock.advance(threshold + Duration::seconds(1));
    let emitted = hub.tracker.sweep(clock.now()).unwrap();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].event_type, "pipeline.stalled");
    assert_eq!(emitted[0].payload["job_id"], "j1");
    assert!(hub.tracker.get("j1").unwrap().stalled);

    clock.advance(threshold);
    assert!(hub.tracker.sweep(clock.now()).unwrap().is_empty());

    // Progress clears the flag; a new stall is a new onset
    let e = stage_event(&hub, "j1", "avatar");
    hub.tracker.observe(&e).unwrap();
    assert!(!hub.tracker.get("j1").unwrap().stalled);
    clock.advance(threshold + Duration::seconds(1));
    assert_eq!(hub.tracker.sweep(clock.now()).unwrap().len(), 1);

    let stalled = hub
        .store
        .query(&EventQuery {
            type_prefix: Some("pipeline.stalled".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(stalled.len(), 2);
}

#[tokio::test]
async fn test_stalled_event_is_not_tracked_back() {
    let clock = clock();
    let hub = Hub::in_memory(options(clock.clone())).unwrap();
    let e = stage_event(&hub, "j1", "tts");
    hub.tracker.observe(&e).unwrap();

    clock.advance(hub.tracker.config().stall_threshold + Duration::seconds(1));
    let stalled = hub.tracker.sweep(clock.now()).unwrap();
    assert_eq!(hub.tracker.observe(&stalled[0]).unwrap(), TrackOutcome::Untracked);
    assert!(hub.tracker.get("j1").unwrap().stalled);
}

#[tokio::test]
async fn test_pipelines_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("hub.db");
    let clock = clock();

    {
        let hub = Hub::open(&db, options(clock.clone())).unwrap();
        let e = stage_event(&hub, "j1", "broll");
        hub.tracker.observe(&e).unwrap();
    }

    let hub = Hub::open(&db, options(clock)).unwrap();
    let pipeline = hub.tracker.get("j1").unwrap();
    assert_eq!(pipeline.stage, "broll");

    // The earlier event is recognised as already applied
    let old = hub.store.get(pipeline.last_event_id).unwrap();
    assert_eq!(hub.tracker.observe(&old).unwrap(), TrackOutcome::Duplicate);
    assert_eq!(hub.tracker.stats().total, 1);
}
