//! Observability events published by the cache engine.
//!
//! Events are fanned out over bounded channels with `try_send`; a slow or
//! vanished subscriber loses events but never blocks the engine.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::ReevaluationReport;

/// Event emitted by the cache engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Anteroom occupancy, emitted every reevaluation cycle.
    AnteroomStatistics {
        /// Adepts currently waiting.
        adepts_waiting: usize,
        /// Adepts discarded before promotion since the engine started.
        wasted_total: u64,
    },
    /// Summary of a finished reevaluation cycle.
    ReevaluationCompleted(ReevaluationReport),
}

#[derive(Debug, Default)]
pub(crate) struct EventPublisher {
    subscribers: Mutex<Vec<Sender<CacheEvent>>>,
    dropped: AtomicU64,
}

impl EventPublisher {
    pub(crate) fn subscribe(&self, capacity: usize) -> Receiver<CacheEvent> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        self.subscribers.lock().push(sender);
        receiver
    }

    pub(crate) fn publish(&self, event: &CacheEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| match subscriber.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events lost to full subscriber queues.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
