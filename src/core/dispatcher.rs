//! Live fan-out of appended events to filtered subscribers.
//!
//! Every subscriber owns a bounded channel. Publishing uses `try_send` and
//! never waits: a subscriber whose buffer is full is disconnected and its
//! stream ends. Dropping a `Subscription` unregisters it immediately.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::domain::{Event, TypePattern};
use crate::error::HubResult;

/// Subscriber-side filter; empty filter matches everything
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub type_glob: Option<TypePattern>,
    pub source: Option<String>,
}

impl EventFilter {
    pub fn new(type_glob: Option<&str>, source: Option<&str>) -> HubResult<Self> {
        let type_glob = match type_glob.filter(|s| !s.is_empty()) {
            Some(glob) => Some(TypePattern::new(glob)?),
            None => None,
        };
        Ok(Self {
            type_glob,
            source: source.filter(|s| !s.is_empty()).map(str::to_string),
        })
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(pattern) = &self.type_glob {
            if !pattern.matches(&event.event_type) {
                return false;
            }
        }
        match &self.source {
            Some(source) => source == &event.source,
            None => true,
        }
    }
}

struct SubscriberEntry {
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

type Registry = Arc<Mutex<HashMap<u64, SubscriberEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<u64, SubscriberEntry>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of live subscribers
pub struct Dispatcher {
    subscribers: Registry,
    next_id: AtomicU64,
    buffer: usize,
}

impl Dispatcher {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber; it sees events published after this call
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        lock(&self.subscribers).insert(id, SubscriberEntry { filter, tx });
        debug!(subscriber = id, "Subscriber registered");

        Subscription {
            id,
            rx,
            registry: Arc::clone(&self.subscribers),
        }
    }

    /// Deliver an event to every matching subscriber without waiting
    pub fn publish(&self, event: &Event) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|id, entry| {
            if !entry.filter.matches(event) {
                return true;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, event_id = event.id, "Subscriber buffer full, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Disconnect every subscriber; their streams end after draining
    pub fn close(&self) {
        lock(&self.subscribers).clear();
    }
}

/// Stream of events for one subscriber
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    registry: Registry,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once disconnected
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if lock(&self.registry).remove(&self.id).is_some() {
            debug!(subscriber = self.id, "Subscriber unregistered");
        }
    }
}
