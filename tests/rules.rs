//! Rule Engine Integration Tests
//!
//! Matching, cooldowns, emit chains and the execution log, driven through
//! `RuleEngine::process` so event order is deterministic.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use eventhub::adapters::RecordingWebhookSender;
use eventhub::core::{Clock, EventQuery, Hub, HubOptions, ManualClock};
use eventhub::domain::{Action, Event, NewEvent, RuleSpec, CHAIN_DEPTH_EXCEEDED};
use serde_json::{json, Value};

fn hub_with_clock() -> (Hub, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()));
    let options = HubOptions::default()
        .with_clock(clock.clone())
        .with_webhook(Arc::new(RecordingWebhookSender::new()));
    (Hub::in_memory(options).unwrap(), clock)
}

fn add_rule(hub: &Hub, pattern: &str, condition: Value, action: Action, cooldown: u64) -> String {
    let rule = RuleSpec {
        name: format!("rule for {}", pattern),
        event_type_pattern: pattern.to_string(),
        source_filter: None,
        condition,
        action,
        cooldown_seconds: cooldown,
        enabled: true,
    }
    .into_rule(uuid::Uuid::new_v4().to_string(), hub.clock.now())
    .unwrap();
    hub.catalog.insert_rule(&rule).unwrap();
    rule.id
}

fn append(hub: &Hub, event_type: &str, payload: Value) -> Event {
    hub.ingest
        .append(NewEvent::new(event_type, "tests", payload))
        .unwrap()
        .event
}

/// Process every stored event after `cursor`, including ones emitted while
/// processing, and return the new cursor
async fn drain(hub: &Hub, mut cursor: i64) -> i64 {
    loop {
        let events = hub.store.events_after(cursor, 100).unwrap();
        if events.is_empty() {
            return cursor;
        }
        for event in events {
            hub.engine.process(&event).await.unwrap();
            cursor = event.id;
        }
    }
}

#[tokio::test]
async fn test_dojo_failure_raises_alert() {
    let (hub, _clock) = hub_with_clock();
    add_rule(
        &hub,
        "dojo.*",
        json!({"payload.retry_count": {"$gt": 2}}),
        Action::Emit {
            event_type: "alert.dojo_failure".to_string(),
            source: Some("alerts".to_string()),
            payload_template: json!({"job_id": "{payload.job_id}", "retries": "{payload.retry_count}"}),
        },
        0,
    );

    append(&hub, "dojo.job_failed", json!({"job_id": "j1", "retry_count": 1}));
    append(&hub, "dojo.job_failed", json!({"job_id": "j2", "retry_count": 3}));
    drain(&hub, 0).await;

    let alerts = hub
        .store
        .query(&EventQuery {
            type_prefix: Some("alert.".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source, "alerts");
    assert_eq!(alerts[0].payload, json!({"job_id": "j2", "retries": 3}));
    assert_eq!(alerts[0].hops, 1);
}

#[tokio::test]
async fn test_cooldown_suppresses_second_firing() {
    let (hub, clock) = hub_with_clock();
    let rule_id = add_rule(
        &hub,
        "deploy.*",
        json!({}),
        Action::Log {
            level: None,
            message: Some("deploy {payload.service}".to_string()),
        },
        60,
    );

    let first = append(&hub, "deploy.done", json!({"service": "api"}));
    clock.advance(Duration::seconds(10));
    let second = append(&hub, "deploy.done", json!({"service": "api"}));

    assert_eq!(hub.engine.process(&first).await.unwrap().len(), 1);
    assert!(hub.engine.process(&second).await.unwrap().is_empty());
    assert_eq!(hub.catalog.list_executions(&rule_id, 10).unwrap().len(), 1);

    clock.advance(Duration::seconds(60));
    let third = append(&hub, "deploy.done", json!({"service": "api"}));
    assert_eq!(hub.engine.process(&third).await.unwrap().len(), 1);

    let log = hub.catalog.list_executions(&rule_id, 10).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].triggering_event_id, third.id);
    assert_eq!(log[0].result.detail, "deploy api");
}

#[tokio::test]
async fn test_self_triggering_rule_is_bounded() {
    let (hub, _clock) = hub_with_clock();
    let rule_id = add_rule(
        &hub,
        "loop.*",
        json!({}),
        Action::Emit {
            event_type: "loop.tick".to_string(),
            source: None,
            payload_template: Value::Null,
        },
        0,
    );

    append(&hub, "loop.start", json!({}));
    drain(&hub, 0).await;

    let max = hub.limits.max_chain_hops as usize;
    let loop_events = hub
        .store
        .query(&EventQuery {
            type_prefix: Some("loop.".to_string()),
            limit: Some(100),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(loop_events.len(), max + 1);
    assert_eq!(loop_events[0].hops as usize, max);

    let log = hub.catalog.list_executions(&rule_id, 100).unwrap();
    assert_eq!(log.len(), max + 1);
    assert!(!log[0].result.success);
    assert_eq!(log[0].result.detail, CHAIN_DEPTH_EXCEEDED);
    assert!(log[1..].iter().all(|r| r.result.success));
}

#[tokio::test]
async fn test_all_matching_rules_fire_for_one_event() {
    let (hub, _clock) = hub_with_clock();
    let a = add_rule(&hub, "*", json!({}), Action::Log { level: None, message: None }, 0);
    let b = add_rule(
        &hub,
        "sharingan.*",
        json!({"payload.kind": "scroll"}),
        Action::Log {
            level: Some("debug".to_string()),
            message: None,
        },
        0,
    );
    let c = add_rule(&hub, "dojo.*", json!({}), Action::Log { level: None, message: None }, 0);

    let event = append(&hub, "sharingan.scroll_updated", json!({"kind": "scroll"}));
    let records = hub.engine.process(&event).await.unwrap();
    assert_eq!(records.len(), 2);

    assert_eq!(hub.catalog.list_executions(&a, 10).unwrap().len(), 1);
    assert_eq!(hub.catalog.list_executions(&b, 10).unwrap().len(), 1);
    assert!(hub.catalog.list_executions(&c, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_rule_does_not_fire() {
    let (hub, _clock) = hub_with_clock();
    let id = add_rule(&hub, "*", json!({}), Action::Log { level: None, message: None }, 0);
    let patch: eventhub::domain::RulePatch =
        serde_json::from_value(json!({"enabled": false})).unwrap();
    hub.catalog.update_rule(&id, patch, hub.clock.now()).unwrap();

    let event = append(&hub, "a.b", json!({}));
    assert!(hub.engine.process(&event).await.unwrap().is_empty());
}
