//! Single entry point for new events.
//!
//! Every producer (HTTP, CLI, emit actions, the scheduler, the stall sweep)
//! appends through `Ingest`, which makes the event durable first and then
//! hands it to the live dispatcher and the consumer feeds without blocking.
//! Append and fan-out happen under one lock, so every subscriber sees
//! events in id order even with concurrent producers.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use super::dispatcher::Dispatcher;
use super::event_store::{Appended, EventStore};
use crate::domain::{Event, NewEvent};
use crate::error::HubResult;

struct ConsumerHandOff {
    name: &'static str,
    tx: mpsc::Sender<Event>,
}

pub struct Ingest {
    store: Arc<EventStore>,
    dispatcher: Arc<Dispatcher>,
    consumers: Vec<ConsumerHandOff>,
    order: Mutex<()>,
}

impl Ingest {
    pub fn new(store: Arc<EventStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            consumers: Vec::new(),
            order: Mutex::new(()),
        }
    }

    /// Register a consumer hand-off channel; call before sharing the ingest
    pub fn add_consumer(&mut self, name: &'static str, buffer: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.consumers.push(ConsumerHandOff { name, tx });
        rx
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Durably append an event, then fan it out.
    ///
    /// Deduplicated appends are not fanned out again.
    pub fn append(&self, new: NewEvent) -> HubResult<Appended> {
        // Held until every hand-off is queued
        let _order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let appended = self.store.append(new)?;
        if !appended.created {
            debug!(event_id = appended.event.id, "Duplicate idempotency key, returning original event");
            return Ok(appended);
        }

        let event = &appended.event;
        info!(
            event_id = event.id,
            event_type = %event.event_type,
            source = %event.source,
            hops = event.hops,
            "Event appended"
        );

        self.dispatcher.publish(event);
        for consumer in &self.consumers {
            match consumer.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(consumer = consumer.name, event_id = event.id, "Consumer hand-off full, consumer will backfill");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::EventFilter;
    use serde_json::json;

    fn ingest() -> Ingest {
        Ingest::new(
            Arc::new(EventStore::open_in_memory().unwrap()),
            Arc::new(Dispatcher::new(16)),
        )
    }

    #[tokio::test]
    async fn test_append_fans_out() {
        let mut ingest = ingest();
        let mut rules = ingest.add_consumer("rules", 4);
        let mut sub = ingest.dispatcher().subscribe(EventFilter::default());

        let appended = ingest
            .append(NewEvent::new("deploy.finished", "deploy", json!({"service": "api"})))
            .unwrap();
        assert!(appended.created);
        assert_eq!(rules.recv().await.unwrap().id, appended.event.id);
        assert_eq!(sub.recv().await.unwrap().id, appended.event.id);
    }

    #[tokio::test]
    async fn test_duplicate_not_fanned_out() {
        let mut ingest = ingest();
        let mut rules = ingest.add_consumer("rules", 4);
        let new = NewEvent::new("deploy.finished", "deploy", json!({})).with_idempotency_key("k1");

        let first = ingest.append(new.clone()).unwrap();
        let second = ingest.append(new).unwrap();
        assert!(!second.created);
        assert_eq!(second.event.id, first.event.id);

        assert_eq!(rules.recv().await.unwrap().id, first.event.id);
        assert!(rules.try_recv().is_err());
    }

    #[test]
    fn test_full_consumer_never_blocks_append() {
        let mut ingest = ingest();
        let _rules = ingest.add_consumer("rules", 1);
        for _ in 0..5 {
            ingest
                .append(NewEvent::new("a.b", "s", json!({})))
                .unwrap();
        }
        assert_eq!(ingest.store().latest_id().unwrap(), 5);
    }
}
