//! Cron scheduler.
//!
//! Ticks more often than once a minute and fires every enabled schedule
//! whose expression includes the current minute. The minute is claimed in
//! the catalog before the event is emitted, so a restart (or a second tick)
//! within the same minute never fires twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::catalog::Catalog;
use super::clock::Clock;
use super::ingest::Ingest;
use super::template;
use crate::domain::schedule::truncate_to_minute;
use crate::domain::{Event, NewEvent, Schedule};
use crate::error::HubResult;

/// Scheduler counters, exposed through the health endpoint
#[derive(Debug, Default, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub total_ticks: u64,
    pub total_fired: u64,
    pub total_errors: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    catalog: Arc<Catalog>,
    ingest: Arc<Ingest>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    stats: Mutex<SchedulerStats>,
    is_running: AtomicBool,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        ingest: Arc<Ingest>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            catalog,
            ingest,
            clock,
            tick_interval,
            stats: Mutex::new(SchedulerStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone();
        stats.running = self.is_running.load(Ordering::Relaxed);
        stats
    }

    /// Fire every schedule due in the minute containing `now`.
    ///
    /// Returns the emitted events.
    pub fn tick(&self, now: DateTime<Utc>) -> HubResult<Vec<Event>> {
        let minute = truncate_to_minute(now);
        let mut fired = Vec::new();
        let mut errors = 0u64;

        for schedule in self.catalog.enabled_schedules()? {
            match self.fire_if_due(&schedule, now, minute) {
                Ok(Some(event)) => fired.push(event),
                Ok(None) => {}
                Err(e) => {
                    errors += 1;
                    warn!(schedule_id = %schedule.id, error = %e, "Schedule failed to fire");
                }
            }
        }

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_ticks += 1;
        stats.total_fired += fired.len() as u64;
        stats.total_errors += errors;
        stats.last_tick_at = Some(now);
        if !fired.is_empty() {
            stats.last_fired_at = Some(now);
        }
        Ok(fired)
    }

    fn fire_if_due(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        minute: DateTime<Utc>,
    ) -> HubResult<Option<Event>> {
        if schedule.last_fired_minute == Some(minute) {
            return Ok(None);
        }
        if !schedule.cron()?.matches_minute(minute) {
            return Ok(None);
        }
        // Record the minute first; losing the race means someone else fired
        if !self.catalog.claim_schedule_minute(&schedule.id, minute)? {
            debug!(schedule_id = %schedule.id, %minute, "Minute already claimed");
            return Ok(None);
        }

        let context = json!({
            "schedule": {"id": schedule.id, "name": schedule.name},
            "fired_at": now.to_rfc3339(),
            "minute": minute.to_rfc3339(),
        });
        let payload = match &schedule.payload_template {
            serde_json::Value::Null => json!({}),
            tpl => template::render(tpl, &context),
        };

        let appended = self.ingest.append(NewEvent::new(
            schedule.event_type.clone(),
            schedule.source.clone(),
            payload,
        ))?;
        info!(
            schedule_id = %schedule.id,
            event_id = appended.event.id,
            event_type = %schedule.event_type,
            "Schedule fired"
        );
        Ok(Some(appended.event))
    }

    /// Tick until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }
        info!(tick_interval = ?self.tick_interval, "Scheduler started");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(self.clock.now()) {
                        warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::dispatcher::Dispatcher;
    use crate::core::event_store::{parse_ts, EventStore};
    use crate::domain::ScheduleSpec;

    fn scheduler(catalog: Arc<Catalog>, clock: Arc<ManualClock>) -> Scheduler {
        let store = Arc::new(EventStore::open_in_memory_with_clock(clock.clone()).unwrap());
        let ingest = Arc::new(Ingest::new(store, Arc::new(Dispatcher::new(8))));
        Scheduler::new(catalog, ingest, clock, Duration::from_secs(30))
    }

    fn add_schedule(catalog: &Catalog, cron: &str) -> Schedule {
        let schedule = ScheduleSpec {
            name: "daily digest".to_string(),
            cron_expression: cron.to_string(),
            event_type: "schedule.daily_digest".to_string(),
            source: "scheduler".to_string(),
            payload_template: json!({"schedule": "{schedule.name}", "minute": "{minute}"}),
            enabled: true,
        }
        .into_schedule("s1".to_string(), Utc::now())
        .unwrap();
        catalog.insert_schedule(&schedule).unwrap();
        schedule
    }

    #[test]
    fn test_fires_once_within_minute() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        add_schedule(&catalog, "0 9 * * *");
        let clock = Arc::new(ManualClock::new(parse_ts("2026-03-14T09:00:05.000000Z").unwrap()));
        let scheduler = scheduler(catalog.clone(), clock.clone());

        let fired = scheduler.tick(clock.now()).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].payload["schedule"], "daily digest");

        let later = parse_ts("2026-03-14T09:00:35.000000Z").unwrap();
        assert!(scheduler.tick(later).unwrap().is_empty());

        let stats = scheduler.stats();
        assert_eq!(stats.total_ticks, 2);
        assert_eq!(stats.total_fired, 1);
    }

    #[test]
    fn test_restart_within_minute_does_not_refire() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        add_schedule(&catalog, "0 9 * * *");
        let clock = Arc::new(ManualClock::new(parse_ts("2026-03-14T09:00:05.000000Z").unwrap()));

        assert_eq!(scheduler(catalog.clone(), clock.clone()).tick(clock.now()).unwrap().len(), 1);

        // Fresh scheduler over the same catalog
        let restarted = scheduler(catalog.clone(), clock.clone());
        let again = parse_ts("2026-03-14T09:00:40.000000Z").unwrap();
        assert!(restarted.tick(again).unwrap().is_empty());

        let next_day = parse_ts("2026-03-15T09:00:10.000000Z").unwrap();
        assert_eq!(restarted.tick(next_day).unwrap().len(), 1);
    }

    #[test]
    fn test_not_due_outside_minute() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        add_schedule(&catalog, "0 9 * * *");
        let clock = Arc::new(ManualClock::new(parse_ts("2026-03-14T09:01:00.000000Z").unwrap()));
        let scheduler = scheduler(catalog, clock.clone());
        assert!(scheduler.tick(clock.now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let scheduler = Arc::new(scheduler(catalog, clock));
        let (stop, shutdown) = watch::channel(false);

        let handle = tokio::spawn(scheduler.clone().run(shutdown));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.stats().running);
        stop.send(true).unwrap();
        handle.await.unwrap();
        assert!(!scheduler.stats().running);
    }
}
