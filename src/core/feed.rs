//! Cursor-tracked, in-order view of the append stream.
//!
//! Ingest hands events to each consumer through a bounded channel with
//! `try_send`. When that hand-off drops an event, the consumer sees a gap
//! in ids (they are gap-free) and backfills from the store. A periodic
//! catch-up tick covers events appended by other processes and the tail of
//! an overflow. The cursor is persisted after every processed event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::event_store::EventStore;
use crate::domain::Event;
use crate::error::HubResult;

/// Maximum events fetched per backfill
const BACKFILL_BATCH: usize = 500;

pub struct ConsumerFeed {
    name: &'static str,
    store: Arc<EventStore>,
    rx: mpsc::Receiver<Event>,
    cursor: i64,
    catchup: Duration,
    hand_off_open: bool,
}

impl ConsumerFeed {
    /// Open a feed, resuming from the persisted cursor.
    ///
    /// A consumer that has never run starts at the current head.
    pub fn open(
        name: &'static str,
        store: Arc<EventStore>,
        rx: mpsc::Receiver<Event>,
        catchup: Duration,
    ) -> HubResult<Self> {
        let cursor = match store.load_offset(name)? {
            Some(cursor) => cursor,
            None => {
                let head = store.latest_id()?;
                store.save_offset(name, head)?;
                head
            }
        };
        debug!(consumer = name, cursor, "Consumer feed opened");

        Ok(Self {
            name,
            store,
            rx,
            cursor,
            catchup,
            hand_off_open: true,
        })
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Wait for the next batch of unprocessed events, in id order.
    ///
    /// Returns `None` once shutdown is signalled.
    pub async fn next_batch(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<Vec<Event>> {
        let mut ticker = tokio::time::interval(self.catchup);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                return None;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
                received = self.rx.recv(), if self.hand_off_open => {
                    match received {
                        Some(event) if event.id <= self.cursor => {}
                        Some(event) if event.id == self.cursor + 1 => return Some(vec![event]),
                        Some(event) => {
                            debug!(consumer = self.name, cursor = self.cursor, received = event.id, "Gap in hand-off, backfilling");
                            if let Some(batch) = self.backfill() {
                                return Some(batch);
                            }
                        }
                        None => self.hand_off_open = false,
                    }
                }
                _ = ticker.tick() => {
                    if let Some(batch) = self.backfill() {
                        return Some(batch);
                    }
                }
            }
        }
    }

    fn backfill(&self) -> Option<Vec<Event>> {
        match self.store.events_after(self.cursor, BACKFILL_BATCH) {
            Ok(events) if events.is_empty() => None,
            Ok(events) => Some(events),
            Err(e) => {
                warn!(consumer = self.name, error = %e, "Backfill failed");
                None
            }
        }
    }

    /// Mark an event processed and persist the cursor
    pub fn commit(&mut self, event_id: i64) {
        if event_id <= self.cursor {
            return;
        }
        self.cursor = event_id;
        if let Err(e) = self.store.save_offset(self.name, event_id) {
            warn!(consumer = self.name, event_id, error = %e, "Failed to persist consumer cursor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewEvent;
    use serde_json::json;

    fn append(store: &EventStore, n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| {
                store
                    .append(NewEvent::new("test.event", "tests", json!({ "n": i })))
                    .unwrap()
                    .event
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_start_begins_at_head() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        append(&store, 3);
        let (_tx, rx) = mpsc::channel(8);
        let feed = ConsumerFeed::open("rules", store.clone(), rx, Duration::from_secs(60)).unwrap();
        assert_eq!(feed.cursor(), 3);
        assert_eq!(store.load_offset("rules").unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_gap_triggers_backfill() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let (tx, rx) = mpsc::channel(8);
        let (_stop, mut shutdown) = watch::channel(false);
        let mut feed = ConsumerFeed::open("rules", store.clone(), rx, Duration::from_secs(60)).unwrap();

        let events = append(&store, 3);
        // Only the last event makes it through the hand-off
        tx.send(events[2].clone()).await.unwrap();

        let batch = feed.next_batch(&mut shutdown).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        for event in &batch {
            feed.commit(event.id);
        }

        // The stale copy arriving late is skipped
        tx.send(events[0].clone()).await.unwrap();
        let next = append(&store, 1);
        tx.send(next[0].clone()).await.unwrap();
        let batch = feed.next_batch(&mut shutdown).await.unwrap();
        assert_eq!(batch[0].id, 4);
    }

    #[tokio::test]
    async fn test_catchup_tick_sees_foreign_appends() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let (_tx, rx) = mpsc::channel(8);
        let (_stop, mut shutdown) = watch::channel(false);
        let mut feed = ConsumerFeed::open("tracker", store.clone(), rx, Duration::from_millis(10)).unwrap();

        append(&store, 2);
        let batch = feed.next_batch(&mut shutdown).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_ends_feed() {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let (_tx, rx) = mpsc::channel(8);
        let (stop, mut shutdown) = watch::channel(false);
        let mut feed = ConsumerFeed::open("rules", store, rx, Duration::from_secs(60)).unwrap();
        stop.send(true).unwrap();
        assert!(feed.next_batch(&mut shutdown).await.is_none());
    }
}
