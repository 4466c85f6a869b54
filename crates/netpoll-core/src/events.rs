// ── Event delivery ──
//
// The engine posts events through an `EventSink`. Events raised in the
// middle of a poll go into a `DeferredEvents` queue first and reach the
// sink only when the cycle flushes it; a cycle that bails out discards
// the queue instead.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::model::Event;

/// Receiver of engine events.
pub trait EventSink: Send + Sync {
    fn post(&self, event: Event);
}

/// Fans events out to any number of `broadcast` subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<Event>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn post(&self, event: Event) {
        trace!(code = %event.code, node_id = event.node_id, "posting event");
        // No subscribers is fine.
        let _ = self.tx.send(Arc::new(event));
    }
}

/// Events held back until the end of one poll cycle.
#[derive(Debug, Default)]
pub struct DeferredEvents {
    queue: Vec<Event>,
}

impl DeferredEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push(event);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Deliver everything queued, in order.
    pub fn flush(&mut self, sink: &dyn EventSink) {
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "flushing deferred events");
        }
        for event in self.queue.drain(..) {
            sink.post(event);
        }
    }

    /// Drop everything queued without delivering it.
    pub fn discard(&mut self) {
        if !self.queue.is_empty() {
            debug!(count = self.queue.len(), "discarding deferred events");
        }
        self.queue.clear();
    }
}
