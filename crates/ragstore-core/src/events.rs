//! Index observability events
//!
//! Every add, delete, persist and search on a collection emits one
//! [`IndexEvent`] to the injected [`IndexObserver`]. [`EventBus`] fans events
//! out to any number of async subscribers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexEventKind {
    Add,
    Delete,
    Persist,
    Search,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEvent {
    pub kind: IndexEventKind,
    pub collection: String,
    /// Entries written, deleted, committed or returned
    pub count: usize,
    pub duration: Duration,
}

/// Receives index events. Must not block.
pub trait IndexObserver: Send + Sync {
    fn on_event(&self, event: &IndexEvent);
}

pub type SharedObserver = Arc<dyn IndexObserver>;

/// Writes events to the `log` facade at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl IndexObserver for LogObserver {
    fn on_event(&self, event: &IndexEvent) {
        log::debug!(
            "[{}] {:?}: {} entries in {:?}",
            event.collection,
            event.kind,
            event.count,
            event.duration
        );
    }
}

/// Broadcast channel for index events
pub struct EventBus {
    sender: broadcast::Sender<IndexEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl IndexObserver for EventBus {
    fn on_event(&self, event: &IndexEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event.clone());
    }
}
